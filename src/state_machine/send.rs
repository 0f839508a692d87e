// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `send(frame, mode)` ack/confirmation wait with retransmission (§4.3).
//!
//! One state machine instance is created per blocking send; `NonBlocking`
//! sends skip this entirely (fire-and-forget past the FIFO gate in
//! `connection::Connection::send`).

use std::{pin::Pin, time::Duration};

use bytes::Bytes;
use tokio::{sync::mpsc, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cemi::CemiFrame,
    error::{ConnResult, ConnectionError},
    state_machine::common::{StateMachine, StateMachineCtx, Transition},
    wire::Status,
};

/// How far `send` waits before returning (§4.3 mode semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    NonBlocking,
    WaitForAck,
    WaitForConfirmation,
}

/// One acked reply observed for the in-flight request, fed in by the
/// connection's receive loop.
#[derive(Debug)]
pub enum SendReply {
    Ack(Status),
    Confirmation(CemiFrame),
}

pub struct SendCtx {
    transmit: Box<dyn Fn() -> ConnResult<()> + Send>,
    cemi: Bytes,
    mode: SendMode,
    ack_timeout: Duration,
    confirmation_timeout: Duration,
    max_attempts: u32,
    attempt: u32,
    replies: mpsc::Receiver<SendReply>,
}

impl SendCtx {
    pub fn new(
        transmit: Box<dyn Fn() -> ConnResult<()> + Send>,
        cemi: Bytes,
        mode: SendMode,
        ack_timeout: Duration,
        confirmation_timeout: Duration,
        max_attempts: u32,
        replies: mpsc::Receiver<SendReply>,
    ) -> Self {
        Self {
            transmit,
            cemi,
            mode,
            ack_timeout,
            confirmation_timeout,
            max_attempts,
            attempt: 0,
            replies,
        }
    }
}

type StepOut = Transition<SendStates, ConnResult<()>>;

#[derive(Debug)]
pub struct AwaitAck;
#[derive(Debug)]
pub struct AwaitConfirmation;

#[derive(Debug)]
pub enum SendStates {
    AwaitAck(AwaitAck),
    AwaitConfirmation(AwaitConfirmation),
}

impl StateMachine<SendCtx, StepOut> for AwaitAck {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = StepOut> + Send + 'a>>
    where
        Self: 'a,
        StepOut: 'a,
        SendCtx: 'a;

    fn step<'a>(&'a self, ctx: &'a mut SendCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            if ctx.attempt >= ctx.max_attempts {
                return Transition::Done(Err(ConnectionError::AckTimeout { attempts: ctx.attempt }));
            }
            ctx.attempt += 1;
            if let Err(err) = (ctx.transmit)() {
                return Transition::Done(Err(err));
            }
            match timeout(ctx.ack_timeout, ctx.replies.recv()).await {
                Ok(Some(SendReply::Ack(status))) if status.is_ok() => {
                    if ctx.mode == SendMode::WaitForConfirmation {
                        Transition::Next(SendStates::AwaitConfirmation(AwaitConfirmation), Ok(()))
                    } else {
                        Transition::Done(Ok(()))
                    }
                },
                Ok(Some(SendReply::Ack(status))) => Transition::Done(Err(ConnectionError::Remote {
                    status: status.to_u8(),
                    text: format!("{status:?}"),
                })),
                Ok(Some(SendReply::Confirmation(_))) => {
                    debug!("confirmation arrived before ack, ignoring out of order");
                    Transition::Next(SendStates::AwaitAck(AwaitAck), Ok(()))
                },
                Ok(None) => Transition::Done(Err(ConnectionError::Protocol(
                    "send reply channel closed".to_string(),
                ))),
                Err(_elapsed) => {
                    warn!(attempt = ctx.attempt, "ack timed out, retransmitting");
                    Transition::Next(SendStates::AwaitAck(AwaitAck), Ok(()))
                },
            }
        })
    }
}

impl StateMachine<SendCtx, StepOut> for AwaitConfirmation {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = StepOut> + Send + 'a>>
    where
        Self: 'a,
        StepOut: 'a,
        SendCtx: 'a;

    fn step<'a>(&'a self, ctx: &'a mut SendCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            match timeout(ctx.confirmation_timeout, ctx.replies.recv()).await {
                Ok(Some(SendReply::Confirmation(con))) => {
                    let sent = match CemiFrame::from_bytes(ctx.cemi.clone()) {
                        Ok(sent) => sent,
                        Err(err) => return Transition::Done(Err(err.into())),
                    };
                    if con.matches_confirmation(&sent) {
                        if con.hop_count() != sent.hop_count() {
                            debug!(
                                sent = ?sent.hop_count(),
                                got = ?con.hop_count(),
                                "accepted confirmation with reduced hop count"
                            );
                        }
                        Transition::Done(Ok(()))
                    } else {
                        Transition::Next(SendStates::AwaitConfirmation(AwaitConfirmation), Ok(()))
                    }
                },
                Ok(Some(SendReply::Ack(_))) => {
                    Transition::Next(SendStates::AwaitConfirmation(AwaitConfirmation), Ok(()))
                },
                Ok(None) => Transition::Done(Err(ConnectionError::Protocol(
                    "send reply channel closed".to_string(),
                ))),
                Err(_elapsed) => Transition::Done(Err(ConnectionError::ConfirmationTimeout)),
            }
        })
    }
}

impl StateMachineCtx<()> for SendCtx {
    async fn execute(&mut self, cancel: &CancellationToken) -> ConnResult<()> {
        let mut state = Some(SendStates::AwaitAck(AwaitAck));
        loop {
            let current = state.take().expect("state machine always holds a state between steps");
            let transition = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
                transition = async {
                    match current {
                        SendStates::AwaitAck(s) => s.step(self).await,
                        SendStates::AwaitConfirmation(s) => s.step(self).await,
                    }
                } => transition,
            };
            match transition {
                Transition::Next(next, _) => state = Some(next),
                Transition::Stay(_) => unreachable!("send never stays in place"),
                Transition::Done(result) => return result,
            }
        }
    }
}
