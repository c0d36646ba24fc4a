use tracing::Level;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

pub struct TracingBuilder {
    level: Level,
}

impl Default for TracingBuilder {
    fn default() -> Self {
        TracingBuilder {
            level: Level::INFO,
        }
    }
}

impl TracingBuilder {
    /// Sets the default log level. `RUST_LOG` still takes priority over
    /// this value.
    pub fn level(mut self, level: Level) -> TracingBuilder {
        self.level = level;
        self
    }

    /// Installs a compact stderr-writing fmt subscriber, filtered by
    /// `RUST_LOG` (falling back to the configured level).
    pub fn build(self) -> Result<(), Error> {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(self.level.into())
                    .from_env()
                    .expect("invalid RUST_LOG"),
            )
            .compact()
            .finish()
            .try_init()?;
        Ok(())
    }
}

/// Installs the default subscriber at `INFO`. Binaries and tests that
/// want a subscriber call this once; the crates themselves never
/// install one implicitly.
pub fn init() -> Result<(), Error> {
    TracingBuilder::default().build()
}
