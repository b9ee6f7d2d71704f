//! Write tracing
//!
//! When a trace sink is attached, each committed write or delete is emitted
//! as one JSON line.

use serde::Serialize;
use std::fmt;
use std::io::Write;

/// Kind of traced operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceOperation {
    /// Insert or overwrite
    Write,
    /// Removal
    Delete,
}

/// One traced store operation
#[derive(Debug, Clone, Serialize)]
pub struct TraceOp {
    /// Operation kind
    pub operation: TraceOperation,
    /// Partition name
    pub store: String,
    /// Hex key
    pub key: String,
    /// Hex value (empty for deletes)
    pub value: String,
    /// Version the operation was committed in
    pub version: u64,
}

/// Line-oriented JSON trace sink
pub struct Tracer {
    writer: Box<dyn Write + Send>,
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer").finish_non_exhaustive()
    }
}

impl Tracer {
    /// Wrap a writer
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self { writer }
    }

    /// Emit one operation
    pub fn trace(&mut self, op: &TraceOp) -> crate::Result<()> {
        let line = serde_json::to_string(op)
            .map_err(|e| crate::Error::Other(format!("Failed to encode trace: {}", e)))?;
        writeln!(self.writer, "{}", line)?;
        Ok(())
    }

    /// Flush the underlying writer
    pub fn flush(&mut self) -> crate::Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
