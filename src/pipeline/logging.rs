//! Traffic logging stage.
//!
//! Passes data through untouched and records each chunk at debug level,
//! with a short hex preview at trace level. Placed behind TLS, so it logs
//! plaintext.

use super::{Context, Handler};
use crate::error::ConnectionError;
use bytes::Bytes;
use std::fmt::Write as _;
use tracing::{debug, trace, warn};

const PREVIEW_LEN: usize = 32;

#[derive(Default)]
pub struct LoggingStage {
    inbound: u64,
    outbound: u64,
}

impl LoggingStage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Handler for LoggingStage {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn on_inbound(&mut self, ctx: &mut Context<'_>, data: Bytes) -> Result<(), ConnectionError> {
        self.inbound += data.len() as u64;
        debug!(conn = %ctx.connection_id(), bytes = data.len(), "READ");
        trace!(conn = %ctx.connection_id(), preview = %hex_preview(&data), "READ");
        ctx.fire_read(data);
        Ok(())
    }

    fn on_outbound(&mut self, ctx: &mut Context<'_>, data: Bytes) -> Result<(), ConnectionError> {
        self.outbound += data.len() as u64;
        debug!(conn = %ctx.connection_id(), bytes = data.len(), "WRITE");
        trace!(conn = %ctx.connection_id(), preview = %hex_preview(&data), "WRITE");
        ctx.write(data);
        Ok(())
    }

    fn on_close(&mut self, ctx: &mut Context<'_>) {
        debug!(
            conn = %ctx.connection_id(),
            inbound = self.inbound,
            outbound = self.outbound,
            "CLOSE"
        );
    }

    fn on_error(&mut self, ctx: &mut Context<'_>, cause: &ConnectionError) {
        warn!(conn = %ctx.connection_id(), error = %cause, "EXCEPTION");
    }
}

fn hex_preview(data: &[u8]) -> String {
    let mut out = String::with_capacity(PREVIEW_LEN * 3 + 3);
    for (i, b) in data.iter().take(PREVIEW_LEN).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{b:02x}");
    }
    if data.len() > PREVIEW_LEN {
        out.push_str(" ..");
    }
    out
}
