// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use tokio_util::sync::CancellationToken;

use crate::error::ConnResult;

/// Outcome of one state-machine step: move to a new state, stay in the
/// current one (used for retry loops), or finish.
#[derive(Debug)]
pub enum Transition<S, R> {
    Next(S, R),
    Stay(R),
    Done(R),
}

/// One state of a state machine driving a shared `Ctx`. `RespCtx` is the
/// per-step result type, normally `Transition<Self::States, ConnResult<T>>`.
pub trait StateMachine<Ctx, RespCtx>: Sized {
    type StepResult<'a>: Future<Output = RespCtx> + Send + 'a
    where
        Self: 'a,
        RespCtx: 'a,
        Ctx: 'a;

    fn step<'a>(&'a self, ctx: &'a mut Ctx) -> Self::StepResult<'a>;
}

/// Drives a state machine to completion, cooperatively cancellable.
pub trait StateMachineCtx<Out> {
    fn execute(
        &mut self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = ConnResult<Out>> + Send;
}
