use crate::infrastructure::error::EngineError;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing::Subscriber;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

pub const LOG_FILE_NAME: &str = "engine.log";
pub const LOG_FILTER_ENV: &str = "CADENCE_LOG";
const DEFAULT_FILTER: &str = "info";

/// Installs the global subscriber writing JSON lines to `logs_dir/engine.log`.
/// Returns `false` when a subscriber was already installed.
pub fn init_logging(logs_dir: &Path) -> Result<bool, EngineError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(logs_dir.join(LOG_FILE_NAME))?;
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let installed = tracing::subscriber::set_global_default(json_subscriber(Mutex::new(file), filter));
    Ok(installed.is_ok())
}

fn json_subscriber<W>(make_writer: W, filter: EnvFilter) -> impl Subscriber + Send + Sync
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .with_ansi(false)
        .with_target(true)
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct BufferWriter {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for BufferWriter {
        fn write(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
            self.buffer
                .lock()
                .expect("log buffer")
                .extend_from_slice(bytes);
            Ok(bytes.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'writer> MakeWriter<'writer> for BufferWriter {
        type Writer = BufferWriter;

        fn make_writer(&'writer self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn events_are_written_as_json_with_fields() {
        let writer = BufferWriter::default();
        let subscriber = json_subscriber(writer.clone(), EnvFilter::new("info"));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(owner_id = "user-1", imported = 2, "sync finished");
            tracing::debug!("filtered out");
        });

        let logs = String::from_utf8(writer.buffer.lock().expect("log buffer").clone())
            .expect("utf8 logs");
        assert_eq!(logs.lines().count(), 1);
        assert!(logs.contains("\"owner_id\":\"user-1\""));
        assert!(logs.contains("sync finished"));
    }
}
