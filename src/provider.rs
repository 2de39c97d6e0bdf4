//! Source trait for telemetry records

use crate::Result;
use crate::types::RawFrame;

/// Trait for telemetry record sources
///
/// Sources abstract over where frames come from (the qdisc debug device, a
/// captured file, an in-memory list) and handle their own timing internally.
#[async_trait::async_trait]
pub trait RecordSource: Send + 'static {
    /// Get the next raw record
    ///
    /// Returns:
    /// - `Ok(Some(frame))` - New record available
    /// - `Ok(None)` - Source ended (normal termination)
    /// - `Err(e)` - Error occurred
    ///
    /// Each source handles timing internally:
    /// - Device: polls in short bounded reads until a record arrives
    /// - Replay: optionally paces records at a fixed interval
    async fn next_frame(&mut self) -> Result<Option<RawFrame>>;

    /// Short description for logs
    fn describe(&self) -> String;
}

#[async_trait::async_trait]
impl<S: RecordSource + ?Sized> RecordSource for Box<S> {
    async fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        (**self).next_frame().await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
