// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `accept_subflows` (§4.11's ambient addition): assembles one accepted
//! connection's kernel I/O into the sub-flow multiplexer pair. The returned
//! [`Subflows`] exposes `catenation`/`division` so a caller can `reserve`
//! and `connect` additional logical layers beyond the primary one this
//! function wires by default, and `mitre` as the pivot application code
//! attaches to for that primary layer.

use std::sync::Arc;

use proctree_common::{Config, MutexExt};
use proctree_core::{ExecutionContext, Processor};
use proctree_flow::{Flow, FlowBase, Mitre, MitreInbound, MitreOutbound, Null};
use proctree_io::{KInput, KOutput, Transports};
use proctree_multiplex::{Catenation, Division, FlowEvent, LayerId};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::warn;

/// The logical layer `accept_subflows` wires to `mitre` by default. A
/// connection that never multiplexes more than one sub-flow never needs to
/// reserve any other.
pub const PRIMARY_LAYER: LayerId = 0;

const KINPUT_CHUNK_SIZE: usize = 16 * 1024;
const LENGTH_PREFIX_BYTES: usize = 4;

fn encode_event(event: &FlowEvent) -> Vec<u8> {
    match bincode::serialize(event) {
        Ok(body) => {
            let mut framed = Vec::with_capacity(LENGTH_PREFIX_BYTES + body.len());
            framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
            framed.extend_from_slice(&body);
            framed
        }
        Err(err) => {
            warn!(%err, "failed to encode sub-flow event, dropping");
            Vec::new()
        }
    }
}

/// The fully wired pipeline for one accepted connection.
pub struct Subflows {
    pub input: Arc<KInput>,
    pub output: Arc<KOutput>,
    pub transports: Arc<Transports>,
    pub catenation: Arc<Catenation>,
    pub division: Arc<Division>,
    pub mitre: Arc<Mitre<Vec<u8>>>,
}

/// Feeds raw chunks read off the kernel socket into the transports stack's
/// input polarity.
struct TransportsInputSink {
    base: FlowBase<Vec<u8>>,
    transports: Arc<Transports>,
}

impl Flow<Vec<u8>> for TransportsInputSink {
    fn base(&self) -> &FlowBase<Vec<u8>> {
        &self.base
    }

    fn process(&self, events: Vec<u8>) {
        if let Err(err) = self.transports.process_input(events) {
            warn!(%err, "input transports stack rejected a chunk");
        }
    }

    fn on_terminate(self: Arc<Self>) {
        if let Err(err) = self.transports.terminate_input() {
            warn!(%err, "error terminating input transports stack");
        }
    }
}

/// Accumulates decoded transports-stack output, splits it into
/// length-prefixed frames, and hands decoded batches to a [`Division`].
struct EventFramer {
    base: FlowBase<Vec<u8>>,
    buffer: std::sync::Mutex<Vec<u8>>,
    division: Arc<Division>,
}

impl EventFramer {
    fn new(division: Arc<Division>) -> Arc<Self> {
        Arc::new(EventFramer { base: FlowBase::new(), buffer: std::sync::Mutex::new(Vec::new()), division })
    }
}

impl Flow<Vec<u8>> for EventFramer {
    fn base(&self) -> &FlowBase<Vec<u8>> {
        &self.base
    }

    fn process(&self, events: Vec<u8>) {
        let mut buffer = self.buffer.lock_or_panic();
        buffer.extend_from_slice(&events);
        let mut batch = Vec::new();
        loop {
            if buffer.len() < LENGTH_PREFIX_BYTES {
                break;
            }
            let mut len_bytes = [0u8; LENGTH_PREFIX_BYTES];
            len_bytes.copy_from_slice(&buffer[..LENGTH_PREFIX_BYTES]);
            let len = u32::from_be_bytes(len_bytes) as usize;
            if buffer.len() < LENGTH_PREFIX_BYTES + len {
                break;
            }
            let body = &buffer[LENGTH_PREFIX_BYTES..LENGTH_PREFIX_BYTES + len];
            match bincode::deserialize::<FlowEvent>(body) {
                Ok(event) => batch.push(event),
                Err(err) => warn!(%err, "dropping malformed sub-flow frame"),
            }
            buffer.drain(..LENGTH_PREFIX_BYTES + len);
        }
        drop(buffer);
        if !batch.is_empty() {
            self.division.accept(batch);
        }
    }

    fn on_terminate(self: Arc<Self>) {
        self.division.interrupt();
    }
}

/// Serializes `Catenation`'s multiplexed event stream and hands the framed
/// bytes to the transports stack's output polarity.
struct EventSerializer {
    base: FlowBase<FlowEvent>,
    transports: Arc<Transports>,
}

impl Flow<FlowEvent> for EventSerializer {
    fn base(&self) -> &FlowBase<FlowEvent> {
        &self.base
    }

    fn process(&self, event: FlowEvent) {
        let framed = encode_event(&event);
        if let Err(err) = self.transports.process_output(framed) {
            warn!(%err, "output transports stack rejected a frame");
        }
    }

    fn on_terminate(self: Arc<Self>) {
        if let Err(err) = self.transports.terminate_output() {
            warn!(%err, "error terminating output transports stack");
        }
    }
}

/// Feeds the transports stack's output polarity into the kernel writer.
struct KOutputSink {
    base: FlowBase<Vec<u8>>,
    koutput: Arc<KOutput>,
}

impl Flow<Vec<u8>> for KOutputSink {
    fn base(&self) -> &FlowBase<Vec<u8>> {
        &self.base
    }

    fn process(&self, events: Vec<u8>) {
        self.koutput.accept(events);
    }

    fn on_terminate(self: Arc<Self>) {
        self.koutput.begin_terminate();
    }
}

/// Wires `reader`/`writer` into a complete kernel-I/O-to-sub-flow pipeline
/// and begins the kernel read loop. Application code attaches to the
/// returned [`Subflows::mitre`] for the primary layer, or reserves further
/// layers on `catenation`/`division` for a genuinely multiplexed protocol.
pub fn accept_subflows<R, W>(context: Arc<ExecutionContext>, reader: R, writer: W, config: &Config) -> Arc<Subflows>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let input = KInput::new(context.clone(), KINPUT_CHUNK_SIZE);
    let output = KOutput::new(context.clone(), writer, config.koutput_queue_limit);
    input.actuate();
    output.actuate();
    let transports = Transports::new(config.transports_recursion_cap);
    let catenation = Catenation::new(config.catenation_queue_limit);
    let division = Division::new();
    let mitre = Mitre::new();

    let input_sink = Arc::new(TransportsInputSink { base: FlowBase::new(), transports: transports.clone() });
    input.connect(input_sink as Arc<dyn Flow<Vec<u8>>>);

    let framer = EventFramer::new(division.clone());
    {
        let t_obstruct = transports.clone();
        let t_clear = transports.clone();
        transports.input().connect_with(
            framer as Arc<dyn Flow<Vec<u8>>>,
            Box::new(move |c| t_obstruct.input().obstruct(c)),
            Box::new(move |c| {
                t_clear.input().clear(&c);
            }),
        );
    }

    let koutput_sink = Arc::new(KOutputSink { base: FlowBase::new(), koutput: output.clone() });
    {
        let t_obstruct = transports.clone();
        let t_clear = transports.clone();
        transports.output().connect_with(
            koutput_sink as Arc<dyn Flow<Vec<u8>>>,
            Box::new(move |c| t_obstruct.output().obstruct(c)),
            Box::new(move |c| {
                t_clear.output().clear(&c);
            }),
        );
    }

    let serializer = Arc::new(EventSerializer { base: FlowBase::new(), transports: transports.clone() });
    catenation.connect_downstream(serializer as Arc<dyn Flow<FlowEvent>>);

    catenation.reserve(PRIMARY_LAYER);
    let outbound = MitreOutbound::new(mitre.clone());
    catenation.connect(PRIMARY_LAYER, Some(outbound as Arc<dyn Flow<Vec<u8>>>));

    let inbound = MitreInbound::new(mitre.clone());
    division.connect(PRIMARY_LAYER, inbound as Arc<dyn Flow<Vec<u8>>>);

    // Layers the peer opens beyond the primary one are reserved on
    // `catenation` and given a discarding sink on `division` the moment
    // they're announced, so a connection that multiplexes more than one
    // sub-flow doesn't stall waiting on a caller who only knows about the
    // primary layer. Application code that cares about a given layer can
    // still `division.connect` over this default before any payload for
    // it arrives.
    {
        let cat = catenation.clone();
        let div = division.clone();
        division.set_on_initiate(move |layers| {
            for layer in layers {
                if layer == PRIMARY_LAYER {
                    continue;
                }
                cat.reserve(layer);
                div.connect(layer, Null::new() as Arc<dyn Flow<Vec<u8>>>);
            }
        });
    }
    division.set_on_overflow(|_data| {
        warn!("sub-flow demultiplexer overran its framing boundary, interrupting");
    });

    input.run(reader);

    Arc::new(Subflows { input, output, transports, catenation, division, mitre })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proctree_flow::Collection;

    #[tokio::test]
    async fn a_reply_written_through_mitre_reaches_the_kernel_writer() {
        let ctx = ExecutionContext::new(Config::default());
        let (client, mut server) = tokio::io::duplex(4096);
        let reader = tokio::io::empty();
        let subflows = accept_subflows(ctx, reader, client, &Config::default());

        subflows.mitre.reply(b"pong".to_vec());

        let mut decoded = Vec::new();
        loop {
            let mut len_buf = [0u8; 4];
            tokio::io::AsyncReadExt::read_exact(&mut server, &mut len_buf).await.unwrap();
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut body = vec![0u8; len];
            tokio::io::AsyncReadExt::read_exact(&mut server, &mut body).await.unwrap();
            let event: FlowEvent = bincode::deserialize(&body).unwrap();
            let is_transfer = matches!(event, FlowEvent::Transfer(PRIMARY_LAYER, ref payload) if payload == b"pong");
            decoded.push(event);
            if is_transfer {
                break;
            }
        }
        assert!(decoded.iter().any(|e| matches!(e, FlowEvent::Initiate(PRIMARY_LAYER))));
    }

    #[tokio::test]
    async fn bytes_read_from_the_kernel_arrive_at_mitre_inbound() {
        let ctx = ExecutionContext::new(Config::default());
        let writer = tokio::io::sink();
        let mut framed = Vec::new();
        let body = bincode::serialize(&FlowEvent::Initiate(PRIMARY_LAYER)).unwrap();
        framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
        framed.extend_from_slice(&body);
        let body = bincode::serialize(&FlowEvent::Transfer(PRIMARY_LAYER, b"ping".to_vec())).unwrap();
        framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
        framed.extend_from_slice(&body);
        let reader = std::io::Cursor::new(framed);

        let subflows = accept_subflows(ctx, reader, writer, &Config::default());
        let received = Collection::new();
        subflows.mitre.inbound().connect_with(received.clone() as Arc<dyn Flow<Vec<u8>>>, Box::new(|_| {}), Box::new(|_| {}));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(received.drain(), vec![b"ping".to_vec()]);
    }
}
