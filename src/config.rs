use std::path::{Path, PathBuf};
use std::time::Duration;

/// Resolved settings for one watcher run.
///
/// There is no config file: every knob is a fixed constant from the
/// `Default` impls below, with a handful of CLI overrides applied in `main`.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub watch: WatchConfig,
    pub renderer: RendererConfig,
    pub sweep: SweepConfig,
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Root of the directory tree to watch, recursively.
    pub root: PathBuf,
    /// Minimum gap between accepted change events for the same path.
    pub debounce_window: Duration,
    /// Pause after an accepted change so the editor finishes writing.
    pub settle_delay: Duration,
    /// Sweep stray GPU-renderer processes once before watching.
    pub startup_sweep: bool,
}

#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Renderer binary invoked for each changed file.
    pub program: String,
    /// Arguments, with `{file}` and `{scene}` placeholders.
    pub args: Vec<String>,
    /// Project root used to build the interpreter search path.
    pub project_root: PathBuf,
    /// Grace period between SIGTERM and SIGKILL when stopping a render.
    pub stop_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Process name of the interpreter that hosts renders.
    pub interpreter_name: String,
    /// Command-line token identifying the renderer.
    pub renderer_token: String,
    /// Command-line flag identifying the alternate GPU-accelerated mode.
    pub gpu_flag: String,
    /// Grace period between SIGTERM and SIGKILL for a stray.
    pub stop_timeout: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            debounce_window: Duration::from_millis(500),
            settle_delay: Duration::from_millis(200),
            startup_sweep: true,
        }
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            program: "manim".to_string(),
            args: vec![
                "--renderer=cairo".to_string(),
                "-pqp".to_string(),
                "{file}".to_string(),
                "{scene}".to_string(),
            ],
            project_root: PathBuf::from("."),
            stop_timeout: Duration::from_secs(2),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interpreter_name: "python".to_string(),
            renderer_token: "manim".to_string(),
            gpu_flag: "--renderer=opengl".to_string(),
            stop_timeout: Duration::from_secs(2),
        }
    }
}

impl RendererConfig {
    /// `PYTHONPATH` value for spawned renders: `<root>:<root>/src`.
    pub fn python_path(&self) -> String {
        let root = self.project_root.display();
        format!("{root}:{root}/src")
    }
}

impl Config {
    /// Build the effective config from CLI arguments.
    ///
    /// The watch root is canonicalized so the renderer's search path stays
    /// valid when spawned from subdirectory events.
    pub fn resolve(root: &Path, renderer_bin: Option<String>, no_sweep: bool) -> Self {
        let root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        let watch = WatchConfig {
            root: root.clone(),
            startup_sweep: !no_sweep,
            ..Default::default()
        };
        let mut renderer = RendererConfig {
            project_root: root,
            ..Default::default()
        };
        if let Some(bin) = renderer_bin {
            renderer.program = bin;
        }
        Config {
            watch,
            renderer,
            sweep: SweepConfig::default(),
        }
    }
}
