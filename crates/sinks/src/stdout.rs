use std::io::Write;

use kexp_core::prelude::*;

/// One JSON document per line on stdout.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl StdoutSink {
    pub fn new() -> Self { Self }
}

#[async_trait::async_trait]
impl Sink for StdoutSink {
    async fn send(&self, event: &EnhancedEvent) -> Result<(), SinkError> {
        let mut line = event.to_json()?;
        line.push(b'\n');
        let mut out = std::io::stdout().lock();
        out.write_all(&line)?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = std::io::stdout().lock().flush() {
            tracing::warn!(error = %e, "stdout flush failed");
        }
    }
}
