use crate::services::CorvusServices;

use corvus_engine::engine::Engine;

#[derive(Clone)]
pub struct AppState<S: CorvusServices> {
    pub services: S,
}

impl<S> CorvusServices for AppState<S>
where
    S: CorvusServices,
{
    type Runtime = S::Runtime;
    type Metrics = S::Metrics;
    type Auth = S::Auth;

    fn engine(&self) -> &Engine<Self::Runtime, Self::Metrics> {
        self.services.engine()
    }
    fn auth(&self) -> &Self::Auth {
        self.services.auth()
    }
}
