//! Dispatch loop: classifies inbound frames, drives the handshake, runs the
//! heartbeat timer, and invokes user callbacks. A slow callback delays only
//! this loop; the wire loop keeps the socket moving.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::codec::{self, Phase};
use crate::events::{EventHub, Message, ProtocolFailure};
use crate::handshake::HandshakeSession;
use crate::identity::{ClientId, Credentials};
use crate::state::{SessionStatus, Shared};
use crate::stats::WireStats;
use crate::wire::Outbound;

/// Commands from the facade. The handshake session is created and mutated
/// only on this loop.
#[derive(Debug)]
pub(crate) enum DispatchCommand {
    BeginHandshake,
}

/// The host is declared dead after this many heartbeat periods of inbound
/// silence.
pub(crate) const SILENCE_PERIODS: u32 = 10;

pub(crate) struct DispatchContext {
    pub client_id: ClientId,
    pub credentials: Option<Credentials>,
    pub heartbeat: Duration,
    pub shared: Arc<Shared>,
    pub events: Arc<EventHub>,
    pub outbound: mpsc::Sender<Outbound>,
    pub status: watch::Sender<SessionStatus>,
    pub stats: Arc<dyn WireStats>,
}

pub(crate) async fn dispatch_loop(
    ctx: DispatchContext,
    mut inbound: mpsc::Receiver<Vec<Vec<u8>>>,
    mut commands: mpsc::Receiver<DispatchCommand>,
) {
    let secured = ctx.credentials.is_some();
    let mut session: Option<HandshakeSession> = None;
    // the heartbeat timer is armed in secured mode only
    let mut ticker = time::interval_at(Instant::now() + ctx.heartbeat, ctx.heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(DispatchCommand::BeginHandshake) => {
                        begin_handshake(&ctx, &mut session).await;
                    }
                    None => {
                        debug!(target: "framewire::dispatch", "command channel closed; exiting");
                        break;
                    }
                }
            }
            frames = inbound.recv() => {
                let Some(frames) = frames else {
                    debug!(target: "framewire::dispatch", "inbound queue closed; exiting");
                    break;
                };
                handle_inbound(&ctx, secured, &mut session, frames);
            }
            _ = ticker.tick(), if secured => {
                liveness_tick(&ctx, session.as_ref()).await;
            }
        }
    }
}

async fn begin_handshake(ctx: &DispatchContext, session: &mut Option<HandshakeSession>) {
    let Some(credentials) = ctx.credentials.clone() else {
        return;
    };
    if session.as_ref().is_some_and(HandshakeSession::is_established) {
        let _ = ctx.status.send(SessionStatus::Established);
        return;
    }
    let mut fresh = HandshakeSession::new(credentials);
    let initiation = fresh.create_initiation_request();
    ctx.shared.reset_cipher();
    ctx.shared.set_throw_on_send(true);
    *session = Some(fresh);
    let _ = ctx.status.send(SessionStatus::Pending);
    enqueue_control(ctx, initiation).await;
}

fn handle_inbound(
    ctx: &DispatchContext,
    secured: bool,
    session: &mut Option<HandshakeSession>,
    frames: Vec<Vec<u8>>,
) {
    if codec::is_heartbeat(&frames) {
        if let Some(session) = session.as_mut() {
            session.record_heartbeat();
        }
        ctx.stats.heartbeat_received();
        return;
    }

    if secured && !ctx.shared.cipher_installed() {
        if let Some(phase) = codec::reply_phase(&frames) {
            drive_handshake(ctx, session, phase, &frames);
        } else {
            warn!(
                target: "framewire::dispatch",
                "unrecognizable frames before session establishment"
            );
            ctx.stats.invalid_message();
            ctx.events.emit_invalid(&Message {
                client_id: ctx.client_id,
                frames,
            });
        }
        return;
    }

    let delivered = match ctx.shared.cipher() {
        Some(cipher) => {
            let mut opened = Vec::with_capacity(frames.len());
            let mut failure = None;
            for frame in &frames {
                match cipher.decrypt(frame) {
                    Ok(frame) => opened.push(frame),
                    Err(error) => {
                        failure = Some(error);
                        break;
                    }
                }
            }
            if let Some(error) = failure {
                warn!(target: "framewire::dispatch", %error, "undecryptable frame");
                ctx.stats.invalid_message();
                ctx.events.emit_invalid(&Message {
                    client_id: ctx.client_id,
                    frames,
                });
                return;
            }
            opened
        }
        None => frames,
    };
    ctx.stats.message_delivered();
    ctx.events.emit_message(&Message {
        client_id: ctx.client_id,
        frames: delivered,
    });
}

fn drive_handshake(
    ctx: &DispatchContext,
    session: &mut Option<HandshakeSession>,
    phase: Phase,
    frames: &[Vec<u8>],
) {
    if phase.is_failure() {
        fail_protocol(ctx, session, &format!("server signaled {phase:?}"));
        return;
    }
    match phase {
        Phase::Step0 => {
            match session
                .as_mut()
                .and_then(|session| session.create_handshake_request(frames))
            {
                Some(request) => try_enqueue_control(ctx, request),
                None => fail_protocol(ctx, session, "opening step rejected"),
            }
        }
        Phase::Step1 => {
            match session
                .as_mut()
                .and_then(|session| session.create_proof_request(frames))
            {
                Some(proof) => try_enqueue_control(ctx, proof),
                None => fail_protocol(ctx, session, "challenge step rejected"),
            }
        }
        Phase::Step2 => {
            let established = session
                .as_mut()
                .map(|session| session.process_proof_reply(frames))
                .unwrap_or(false);
            if established {
                if let Some(cipher) = session.as_ref().and_then(HandshakeSession::cipher) {
                    ctx.shared.install_cipher(cipher);
                }
                ctx.shared.set_throw_on_send(false);
                let _ = ctx.status.send(SessionStatus::Established);
                ctx.stats.handshake_established();
                ctx.events.emit_established(&ctx.client_id);
            } else {
                fail_protocol(ctx, session, "closing proof rejected");
            }
        }
        Phase::Fail0 | Phase::Fail1 | Phase::Fail2 | Phase::Fatal => unreachable!(),
    }
}

fn fail_protocol(ctx: &DispatchContext, session: &mut Option<HandshakeSession>, reason: &str) {
    if let Some(session) = session.as_mut() {
        session.fail();
    }
    ctx.shared.set_throw_on_send(true);
    let _ = ctx.status.send(SessionStatus::Failed);
    ctx.stats.handshake_failed();
    warn!(target: "framewire::dispatch", reason, "encryption protocol failed");
    ctx.events.emit_failed(&ProtocolFailure {
        client_id: ctx.client_id,
        reason: reason.to_string(),
    });
}

async fn liveness_tick(ctx: &DispatchContext, session: Option<&HandshakeSession>) {
    if ctx.shared.host_dead() {
        return;
    }
    if ctx.shared.cipher_installed() {
        let silence = session
            .map(|session| session.last_heartbeat().elapsed())
            .unwrap_or(Duration::ZERO);
        if silence > ctx.heartbeat * SILENCE_PERIODS {
            ctx.shared.latch_host_dead();
            ctx.stats.host_declared_dead();
            warn!(
                target: "framewire::dispatch",
                silence_ms = silence.as_millis() as u64,
                "no heartbeat from host; declaring dead"
            );
        } else {
            enqueue_control(ctx, vec![codec::HEARTBEAT.to_vec()]).await;
            ctx.stats.heartbeat_sent();
        }
    } else {
        // not established yet: keep application sends gated
        ctx.shared.set_throw_on_send(true);
    }
}

async fn enqueue_control(ctx: &DispatchContext, frames: Vec<Vec<u8>>) {
    if ctx
        .outbound
        .send(Outbound::Control(frames))
        .await
        .is_err()
    {
        debug!(target: "framewire::dispatch", "outbound queue closed");
    }
}

/// Variant for the synchronous classification path. A handshake produces a
/// handful of control messages, so a saturated queue here means the wire
/// loop is gone; the drop is logged and the exchange will fail on silence.
fn try_enqueue_control(ctx: &DispatchContext, frames: Vec<Vec<u8>>) {
    if let Err(error) = ctx.outbound.try_send(Outbound::Control(frames)) {
        warn!(target: "framewire::dispatch", %error, "control frames dropped");
    }
}
