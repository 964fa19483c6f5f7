//! Echo stage: writes every inbound chunk straight back.
//!
//! Terminal stage of every pipeline. No framing, no transformation, no
//! state; the chunk's `Bytes` handle is passed back without copying.

use super::{Context, Handler};
use crate::error::ConnectionError;
use bytes::Bytes;

pub struct EchoHandler;

impl Handler for EchoHandler {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn on_inbound(&mut self, ctx: &mut Context<'_>, data: Bytes) -> Result<(), ConnectionError> {
        ctx.write(data);
        Ok(())
    }
}
