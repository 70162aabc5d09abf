//! Mock node builders shared by the integration suites.
//!
//! A small family of blocks, enough to exercise both engines end to
//! end: a radio with a coerced master clock rate and an always-updating
//! rssi, a DDC with decimation coercion and stream-command rescaling, a
//! FIFO that passes everything through, and streamers for the graph
//! edges facing software.
//!
//! Builders return the node plus a probe struct of shared cells, so
//! tests can observe resolver activity and handler state after the node
//! has been moved into the graph.

#![allow(dead_code)]

use std::cell::Cell;
use std::rc::Rc;

use rfgraph_core::{
    ActionPayload, ForwardingPolicy, Node, RxErrorCode, SourceInfo, SourceKind, StreamMode,
};

pub const MAX_DECIM: i64 = 512;
pub const DEFAULT_RATE: f64 = 1e9;
pub const DEFAULT_DECIM: i64 = 1;

/// Pretend we can hit all even decimations up to `MAX_DECIM`, or 1.
pub fn coerce_decim(requested: i64) -> i64 {
    if requested <= 1 {
        return 1;
    }
    (requested - requested % 2).min(MAX_DECIM)
}

// ---------------------------------------------------------------------------
// Mock radio
// ---------------------------------------------------------------------------

pub struct RadioProbes {
    /// Number of times the rssi resolver ran.
    pub rssi_resolver_count: Rc<Cell<u64>>,
    /// Number of times the master-clock-rate resolver ran.
    pub mcr_resolver_count: Rc<Cell<u64>>,
    /// num_samps of the last bounded stream command received.
    pub last_num_samps: Rc<Cell<u64>>,
    /// When set, the output-rate resolvers pin `samp_rate` (output side)
    /// to `force_samp_out_value` instead of following the clock.
    pub disable_samp_out_resolver: Rc<Cell<bool>>,
    pub force_samp_out_value: Rc<Cell<f64>>,
}

/// Full-duplex radio with two supported master clock rates (100e6 and
/// 200e6) and an rssi that needs updating on every pass.
pub fn mock_radio(radio_idx: usize) -> (Node, RadioProbes) {
    let probes = RadioProbes {
        rssi_resolver_count: Rc::new(Cell::new(0)),
        mcr_resolver_count: Rc::new(Cell::new(0)),
        last_num_samps: Rc::new(Cell::new(0)),
        disable_samp_out_resolver: Rc::new(Cell::new(false)),
        force_samp_out_value: Rc::new(Cell::new(23e6)),
    };

    let mut node = Node::new(format!("MOCK_RADIO{}", radio_idx), 1, 1);
    // A radio streams fine with only one side connected.
    node.set_topology_check(|_, _| true);
    node.set_action_forwarding_policy(ForwardingPolicy::Drop, "");

    let samp_rate_in = node
        .register_property("samp_rate", SourceInfo::input_edge(0), 200e6)
        .unwrap();
    let samp_rate_out = node
        .register_property("samp_rate", SourceInfo::output_edge(0), 200e6)
        .unwrap();
    let mcr = node
        .register_property("master_clock_rate", SourceInfo::user(), 200e6)
        .unwrap();
    let rssi = node.register_property("rssi", SourceInfo::user(), 0.0).unwrap();

    // Input rate always snaps back to the master clock rate.
    node.add_property_resolver(vec![samp_rate_in], vec![samp_rate_in], move |ctx| {
        let rate: f64 = ctx.get(mcr)?;
        ctx.set(samp_rate_in, rate)
    })
    .unwrap();

    // Output rate follows the clock, unless pinned by a test.
    {
        let disable = Rc::clone(&probes.disable_samp_out_resolver);
        let force = Rc::clone(&probes.force_samp_out_value);
        node.add_property_resolver(vec![samp_rate_out], vec![samp_rate_out], move |ctx| {
            if disable.get() {
                return ctx.set(samp_rate_out, force.get());
            }
            let rate: f64 = ctx.get(mcr)?;
            ctx.set(samp_rate_out, rate)
        })
        .unwrap();
    }

    // Master clock rate coerces to one of the two supported rates and
    // drags both edge rates along.
    {
        let count = Rc::clone(&probes.mcr_resolver_count);
        let disable = Rc::clone(&probes.disable_samp_out_resolver);
        let force = Rc::clone(&probes.force_samp_out_value);
        node.add_property_resolver(
            vec![mcr],
            vec![mcr, samp_rate_in, samp_rate_out],
            move |ctx| {
                count.set(count.get() + 1);
                let requested: f64 = ctx.get(mcr)?;
                let coerced = if requested > 150e6 { 200e6 } else { 100e6 };
                ctx.set(mcr, coerced)?;
                ctx.set(samp_rate_in, coerced)?;
                if disable.get() {
                    ctx.set(samp_rate_out, force.get())
                } else {
                    ctx.set(samp_rate_out, coerced)
                }
            },
        )
        .unwrap();
    }

    // Depending on the sentinel keeps rssi fresh on every pass.
    {
        let count = Rc::clone(&probes.rssi_resolver_count);
        node.add_property_resolver(vec![Node::ALWAYS_DIRTY], vec![rssi], move |ctx| {
            count.set(count.get() + 1);
            ctx.set(rssi, count.get() as f64)
        })
        .unwrap();
    }

    {
        let last = Rc::clone(&probes.last_num_samps);
        node.register_action_handler("stream_cmd", move |_node, _src, action, _outbox| {
            if let ActionPayload::StreamCmd(cmd) = action.payload() {
                match cmd.mode {
                    StreamMode::StartContinuous | StreamMode::StopContinuous => {}
                    _ => last.set(cmd.num_samps),
                }
            }
            Ok(())
        });
    }

    (node, probes)
}

// ---------------------------------------------------------------------------
// Mock DDC
// ---------------------------------------------------------------------------

pub struct DdcProbes {
    /// Number of times the decimation resolver ran.
    pub decim_resolver_count: Rc<Cell<u64>>,
}

/// Single-channel DDC: coerces decimation and keeps both rates
/// consistent with it. Rescales bounded stream commands crossing it.
pub fn mock_ddc() -> (Node, DdcProbes) {
    let probes = DdcProbes {
        decim_resolver_count: Rc::new(Cell::new(0)),
    };

    let mut node = Node::new("MOCK_DDC", 1, 1);
    node.set_topology_check(|_, _| true);

    let samp_rate_in = node
        .register_property("samp_rate", SourceInfo::input_edge(0), DEFAULT_RATE)
        .unwrap();
    let samp_rate_out = node
        .register_property("samp_rate", SourceInfo::output_edge(0), DEFAULT_RATE)
        .unwrap();
    let decim = node
        .register_property("decim", SourceInfo::user(), DEFAULT_DECIM)
        .unwrap();

    // User touched decim: coerce it, keep the input rate, recompute the
    // output rate.
    {
        let count = Rc::clone(&probes.decim_resolver_count);
        node.add_property_resolver(vec![decim], vec![decim, samp_rate_out], move |ctx| {
            count.set(count.get() + 1);
            let requested: i64 = ctx.get(decim)?;
            let coerced = coerce_decim(requested);
            ctx.set(decim, coerced)?;
            let input: f64 = ctx.get(samp_rate_in)?;
            ctx.set(samp_rate_out, input / coerced as f64)
        })
        .unwrap();
    }

    // Input rate moved: match decim so the output rate survives where
    // possible.
    node.add_property_resolver(
        vec![samp_rate_in],
        vec![decim, samp_rate_out],
        move |ctx| {
            let input: f64 = ctx.get(samp_rate_in)?;
            let output: f64 = ctx.get(samp_rate_out)?;
            let coerced = coerce_decim((input / output) as i64);
            ctx.set(decim, coerced)?;
            ctx.set(samp_rate_out, input / coerced as f64)
        },
    )
    .unwrap();

    // Output rate moved: like the previous one, flipped.
    node.add_property_resolver(
        vec![samp_rate_out],
        vec![decim, samp_rate_in],
        move |ctx| {
            let input: f64 = ctx.get(samp_rate_in)?;
            let output: f64 = ctx.get(samp_rate_out)?;
            let coerced = coerce_decim((input / output) as i64);
            ctx.set(decim, coerced)?;
            ctx.set(samp_rate_in, output * coerced as f64)
        },
    )
    .unwrap();

    // A bounded stream command crossing the DDC covers decim-times more
    // samples on the upstream side.
    node.register_action_handler("stream_cmd", move |node, src, action, outbox| {
        let upstream = src.inverted();
        let rewritten = match action.payload() {
            ActionPayload::StreamCmd(cmd)
                if matches!(
                    cmd.mode,
                    StreamMode::NumSampsAndDone | StreamMode::NumSampsAndMore
                ) =>
            {
                let decim: i64 = node.property(SourceInfo::user(), "decim")?;
                let mut cmd = cmd.clone();
                cmd.num_samps = if src.kind == SourceKind::OutputEdge {
                    cmd.num_samps * decim as u64
                } else {
                    cmd.num_samps / decim as u64
                };
                rfgraph_core::Action::new(action.key(), ActionPayload::StreamCmd(cmd))
            }
            other => rfgraph_core::Action::new(action.key(), other.clone()),
        };
        outbox.post(upstream, rewritten)
    });

    (node, probes)
}

// ---------------------------------------------------------------------------
// Mock FIFO
// ---------------------------------------------------------------------------

/// Pass-through block: no properties of its own, everything forwarded
/// one-to-one.
pub fn mock_fifo(num_ports: usize) -> Node {
    let mut node = Node::new("MOCK_FIFO", num_ports, num_ports);
    node.set_prop_forwarding_policy(ForwardingPolicy::OneToOne, "");
    node.set_action_forwarding_policy(ForwardingPolicy::OneToOne, "");
    node
}

// ---------------------------------------------------------------------------
// Mock streamers
// ---------------------------------------------------------------------------

pub struct StreamerProbes {
    /// Error code of the last RX event received.
    pub last_rx_error: Rc<Cell<Option<RxErrorCode>>>,
}

/// RX streamer: mirrors its input-edge rate into the user-facing
/// `samp_rate` and vice versa. Drops everything it doesn't know.
pub fn mock_streamer(num_ports: usize) -> (Node, StreamerProbes) {
    let probes = StreamerProbes {
        last_rx_error: Rc::new(Cell::new(None)),
    };

    let mut node = Node::new("MOCK_STREAMER", num_ports, num_ports);
    node.set_topology_check(|_, _| true);
    node.set_prop_forwarding_policy(ForwardingPolicy::Drop, "");
    node.set_action_forwarding_policy(ForwardingPolicy::Drop, "");

    let samp_rate_user = node
        .register_property("samp_rate", SourceInfo::user(), 1e6)
        .unwrap();
    let samp_rate_in = node
        .register_property("samp_rate", SourceInfo::input_edge(0), 1e6)
        .unwrap();

    node.add_property_resolver(vec![samp_rate_user], vec![samp_rate_in], move |ctx| {
        let rate: f64 = ctx.get(samp_rate_user)?;
        ctx.set(samp_rate_in, rate)
    })
    .unwrap();
    node.add_property_resolver(vec![samp_rate_in], vec![samp_rate_user], move |ctx| {
        let rate: f64 = ctx.get(samp_rate_in)?;
        ctx.set(samp_rate_user, rate)
    })
    .unwrap();

    {
        let last = Rc::clone(&probes.last_rx_error);
        node.register_action_handler("rx_event", move |_node, _src, action, _outbox| {
            if let ActionPayload::RxEvent(event) = action.payload() {
                last.set(Some(event.error_code));
            }
            Ok(())
        });
    }

    (node, probes)
}

/// Streamer variant for loop topologies: its output-edge rate is pinned
/// to a fixed value so a back-edge consistency check has something to
/// disagree with.
pub fn mock_loop_streamer(pinned_rate: f64) -> Node {
    let mut node = Node::new("MOCK_LOOP_STREAMER", 1, 1);
    node.set_topology_check(|_, _| true);
    node.set_prop_forwarding_policy(ForwardingPolicy::Drop, "");
    node.set_action_forwarding_policy(ForwardingPolicy::Drop, "");

    let samp_rate_in = node
        .register_property("samp_rate", SourceInfo::input_edge(0), pinned_rate)
        .unwrap();
    let samp_rate_out = node
        .register_property("samp_rate", SourceInfo::output_edge(0), pinned_rate)
        .unwrap();

    node.add_property_resolver(vec![samp_rate_out], vec![samp_rate_out], move |ctx| {
        ctx.set(samp_rate_out, pinned_rate)
    })
    .unwrap();
    node.add_property_resolver(vec![samp_rate_in], vec![], |_ctx| Ok(()))
        .unwrap();

    node
}
