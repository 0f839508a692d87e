// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Connect/disconnect handshake state machine (§4.3 "Connect sequence").
//!
//! One marker struct per visible state, boxed-future `step`s, driven by a
//! `StateMachineCtx::execute` loop that owns the shared [`ConnectCtx`] and
//! matches on the [`Transition`] each step returns. Unlike a keepalive
//! exchange (which only ever waits for one reply), `Connect.req` can be
//! retransmitted up to `max_attempts` times, so `Wait` falls back to
//! `Send` on a per-attempt timeout instead of failing immediately.

use std::{pin::Pin, time::Duration};

use tokio::{sync::mpsc, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::{ConnResult, ConnectionError},
    state_machine::common::{StateMachine, StateMachineCtx, Transition},
    wire::{ConnectResponse, Crd, Hpai},
};

/// Outcome of a successful `Connect.req`/`Connect.res` exchange.
#[derive(Debug, Clone, Copy)]
pub struct Connected {
    pub channel_id: u8,
    pub data_endpoint: Hpai,
    pub crd: Crd,
}

/// Shared state threaded through the connect state machine's steps.
///
/// `transmit` builds and sends one `Connect.req`; it is a closure rather
/// than an owned socket so the caller decides the wire path (plain UDP, or
/// a secure session's wrap-then-send), the same way [`crate::state_machine::send::SendCtx`]
/// and the heartbeat loop take their transmit step.
pub struct ConnectCtx {
    transmit: Box<dyn Fn() -> ConnResult<()> + ::std::marker::Send>,
    ack_timeout: Duration,
    max_attempts: u32,
    attempt: u32,
    /// Fed by the owning connection's receive loop once it recognises a
    /// `Connect.res` addressed to this handshake.
    responses: mpsc::Receiver<ConnectResponse>,
    /// Set by [`Wait`] right before returning `Transition::Done(Ok(()))`;
    /// `execute` takes it to build the final return value.
    result: Option<Connected>,
}

impl ConnectCtx {
    pub fn new(
        transmit: Box<dyn Fn() -> ConnResult<()> + ::std::marker::Send>,
        ack_timeout: Duration,
        max_attempts: u32,
        responses: mpsc::Receiver<ConnectResponse>,
    ) -> Self {
        Self { transmit, ack_timeout, max_attempts, attempt: 0, responses, result: None }
    }
}

type StepOut = Transition<ConnectStates, ConnResult<()>>;

#[derive(Debug)]
pub struct Send;
#[derive(Debug)]
pub struct Wait;

#[derive(Debug)]
pub enum ConnectStates {
    Send(Send),
    Wait(Wait),
}

impl StateMachine<ConnectCtx, StepOut> for Send {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = StepOut> + ::std::marker::Send + 'a>>
    where
        Self: 'a,
        StepOut: 'a,
        ConnectCtx: 'a;

    fn step<'a>(&'a self, ctx: &'a mut ConnectCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            if ctx.attempt >= ctx.max_attempts {
                return Transition::Done(Err(ConnectionError::AckTimeout { attempts: ctx.attempt }));
            }
            ctx.attempt += 1;
            match (ctx.transmit)() {
                Ok(()) => {
                    debug!(attempt = ctx.attempt, "sent Connect.req");
                    Transition::Next(ConnectStates::Wait(Wait), Ok(()))
                },
                Err(err) => Transition::Done(Err(err)),
            }
        })
    }
}

impl StateMachine<ConnectCtx, StepOut> for Wait {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = StepOut> + ::std::marker::Send + 'a>>
    where
        Self: 'a,
        StepOut: 'a,
        ConnectCtx: 'a;

    fn step<'a>(&'a self, ctx: &'a mut ConnectCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            match timeout(ctx.ack_timeout, ctx.responses.recv()).await {
                Ok(Some(response)) => match resolve(response) {
                    Ok(connected) => {
                        ctx.result = Some(connected);
                        Transition::Done(Ok(()))
                    },
                    Err(err) => Transition::Done(Err(err)),
                },
                Ok(None) => Transition::Done(Err(ConnectionError::Protocol(
                    "Connect.res channel closed".to_string(),
                ))),
                Err(_elapsed) => {
                    warn!(attempt = ctx.attempt, "Connect.res timed out, retransmitting");
                    Transition::Next(ConnectStates::Send(Send), Ok(()))
                },
            }
        })
    }
}

fn resolve(response: ConnectResponse) -> ConnResult<Connected> {
    if !response.status.is_ok() {
        return Err(ConnectionError::Remote {
            status: response.status.to_u8(),
            text: format!("{:?}", response.status),
        });
    }
    let data_endpoint = response.data_endpoint.ok_or_else(|| {
        ConnectionError::Protocol("Connect.res missing data endpoint on success".to_string())
    })?;
    let crd = response
        .crd
        .ok_or_else(|| ConnectionError::Protocol("Connect.res missing CRD on success".to_string()))?;
    Ok(Connected { channel_id: response.channel_id, data_endpoint, crd })
}

impl StateMachineCtx<Connected> for ConnectCtx {
    async fn execute(&mut self, cancel: &CancellationToken) -> ConnResult<Connected> {
        let mut state = Some(ConnectStates::Send(Send));
        loop {
            let current = state.take().expect("state machine always holds a state between steps");
            let transition = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
                transition = async {
                    match current {
                        ConnectStates::Send(s) => s.step(self).await,
                        ConnectStates::Wait(s) => s.step(self).await,
                    }
                } => transition,
            };
            match transition {
                Transition::Next(next, _) => state = Some(next),
                Transition::Stay(_) => unreachable!("connect handshake never stays in place"),
                Transition::Done(Ok(())) => {
                    return self.result.take().ok_or_else(|| {
                        ConnectionError::Protocol("connect handshake finished without a result".to_string())
                    });
                },
                Transition::Done(Err(err)) => return Err(err),
            }
        }
    }
}
