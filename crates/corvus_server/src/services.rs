use corvus_core::prelude::*;
use corvus_engine::engine::Engine;

/// Everything a request handler can reach.
pub trait CorvusServices: Send + Sync + 'static + Clone {
    type Runtime: SandboxRuntime;
    type Metrics: MetricsSink;
    type Auth: AuthProvider;

    fn engine(&self) -> &Engine<Self::Runtime, Self::Metrics>;
    fn auth(&self) -> &Self::Auth;
}

#[derive(Clone)]
pub struct CoreServices<R: SandboxRuntime, M: MetricsSink, A> {
    pub engine: Engine<R, M>,
    pub auth: A,
}

impl<R, M, A> CorvusServices for CoreServices<R, M, A>
where
    R: SandboxRuntime,
    M: MetricsSink,
    A: AuthProvider,
{
    type Runtime = R;
    type Metrics = M;
    type Auth = A;

    fn engine(&self) -> &Engine<R, M> {
        &self.engine
    }
    fn auth(&self) -> &A {
        &self.auth
    }
}
