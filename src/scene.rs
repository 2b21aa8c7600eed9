//! Scene class detection for manim source files.
//!
//! This is a best-effort textual heuristic, not a Python parser: the first
//! line that starts with `class ` and mentions `(Scene)` wins. Indented,
//! multi-line, or otherwise exotic declarations are deliberately ignored —
//! upgrading this to real parsing is out of scope.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Lines must start with this to be considered a declaration.
const CLASS_PREFIX: &str = "class ";
/// Marker identifying a scene-like base class.
const SCENE_MARKER: &str = "(Scene)";

/// Find the first declared scene class in a file.
///
/// Returns `None` when the file has no matching declaration or cannot be
/// read; read and decode failures are logged as warnings, never fatal.
pub fn find_scene_class(path: &Path) -> Option<String> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "failed to open scene file");
            return None;
        }
    };

    for line in BufReader::new(file).lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to read scene file");
                return None;
            }
        };
        if let Some(name) = parse_scene_class(&line) {
            return Some(name);
        }
    }
    None
}

/// Extract the class name from a single declaration line, if it is one.
fn parse_scene_class(line: &str) -> Option<String> {
    let rest = line.strip_prefix(CLASS_PREFIX)?;
    if !line.contains(SCENE_MARKER) {
        return None;
    }
    let name = rest.split('(').next()?.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}
