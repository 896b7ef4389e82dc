//! Terminal color policy for log output.
//!
//! Resolution order: an explicit `--color always|never` wins; in `auto`,
//! `NO_COLOR` or `EMACS` in the environment disable color, otherwise color
//! follows whether the stream is a terminal.

use std::env;

/// When to emit ANSI colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ColorWhen {
    /// Color only when the stream is a TTY.
    #[default]
    Auto,

    /// Always color.
    Always,

    /// Never color.
    Never,
}

impl ColorWhen {
    // ---
    /// Whether ANSI color should be used on `stream`.
    pub fn should_color(self, stream: atty::Stream) -> bool {
        // ---
        let env_disables = env::var_os("NO_COLOR").is_some() || env::var_os("EMACS").is_some();
        self.resolve(env_disables, atty::is(stream))
    }

    /// Logs go to stderr.
    pub fn should_color_stderr(self) -> bool {
        // ---
        self.should_color(atty::Stream::Stderr)
    }

    fn resolve(self, env_disables: bool, is_tty: bool) -> bool {
        // ---
        match self {
            ColorWhen::Always => true,
            ColorWhen::Never => false,
            ColorWhen::Auto => !env_disables && is_tty,
        }
    }
}
