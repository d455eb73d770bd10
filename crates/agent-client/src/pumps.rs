//! Per-connection tasks: one writer, one heartbeat prober, one reader.

pub(crate) mod heartbeat;
pub(crate) mod read;
pub(crate) mod write;
