//! Layered protocol stacks.
//!
//! A stack is an ordered list of protocol layers. Datagrams received from a
//! socket are dispatched *upward* starting at the bottom layer; sends flow
//! *downward* from the top. Each layer may transform, consume or reject a
//! datagram.

use std::time::Instant;

use crate::datagram::Datagram;
use crate::NetResult;

/// Identifies the socket an upward event arrived on.
pub type SocketId = usize;

/// Metadata accompanying an upward call: either a regular delivery or an
/// error condition surfaced by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoUpMeta {
    /// Regular data delivery.
    Data,
    /// Transport failure (peer close, network error); the datagram is
    /// empty.
    Error {
        /// OS error code, 0 for orderly end-of-stream.
        code: i32,
    },
}

impl ProtoUpMeta {
    pub fn has_error(&self) -> bool {
        matches!(self, ProtoUpMeta::Error { .. })
    }
}

/// Metadata accompanying a downward call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProtoDownMeta {
    /// Segment the message originates from, for fair send queueing.
    pub segment: galena_types::SegmentId,
}

/// One protocol layer.
///
/// Layers are stacked by a [`Protostack`]; the default `handle_timers`
/// reports no deadline.
pub trait Protolay {
    /// Processes an upward event. Returns the datagram to hand to the layer
    /// above, or `None` to consume it.
    fn handle_up(&mut self, id: SocketId, dg: Datagram, meta: &ProtoUpMeta) -> Option<Datagram>;

    /// Processes a downward send. Returns the datagram to hand to the layer
    /// below, or `None` to consume it.
    fn handle_down(&mut self, dg: Datagram, meta: &ProtoDownMeta) -> NetResult<Option<Datagram>>;

    /// Fires due timers; returns the next deadline this layer needs.
    fn handle_timers(&mut self, now: Instant) -> Option<Instant> {
        let _ = now;
        None
    }
}

/// An ordered list of protocol layers, bottom first.
#[derive(Default)]
pub struct Protostack {
    layers: Vec<Box<dyn Protolay>>,
}

impl Protostack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a layer on top of the stack.
    pub fn push_proto(&mut self, layer: Box<dyn Protolay>) {
        self.layers.push(layer);
    }

    /// Removes the top layer.
    pub fn pop_proto(&mut self) -> Option<Box<dyn Protolay>> {
        self.layers.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Dispatches an upward event through the layers, bottom to top.
    pub fn dispatch(&mut self, id: SocketId, dg: Datagram, meta: &ProtoUpMeta) {
        let mut current = Some(dg);
        for layer in &mut self.layers {
            match current.take() {
                Some(dg) => current = layer.handle_up(id, dg, meta),
                None => break,
            }
        }
    }

    /// Sends a datagram downward through the layers, top to bottom;
    /// whatever emerges from the bottom layer is returned for the socket.
    pub fn send(&mut self, dg: Datagram, meta: &ProtoDownMeta) -> NetResult<Option<Datagram>> {
        let mut current = Some(dg);
        for layer in self.layers.iter_mut().rev() {
            match current.take() {
                Some(dg) => current = layer.handle_down(dg, meta)?,
                None => break,
            }
        }
        Ok(current)
    }

    /// Fires due timers on every layer; returns the earliest next deadline.
    pub fn handle_timers(&mut self, now: Instant) -> Option<Instant> {
        self.layers
            .iter_mut()
            .filter_map(|layer| layer.handle_timers(now))
            .min()
    }
}
