//! C7 — Operator Handler Registry (§4.7).
//!
//! Handlers are constructed at plan setup, shared across every worker
//! thread executing the plan, and destroyed at plan teardown. Rather than
//! a trait-object hierarchy (which would reintroduce the `shared_ptr`
//! cycles §9 calls out), the catalog is a closed set of five variants
//! modeled as a tagged enum — each pipeline carries a fixed-size vector of
//! indices into one [`HandlerRegistry`].

pub mod aggregation;
pub mod join;
pub mod network_sink;
pub mod network_source;
pub mod statistic;

pub use aggregation::AggregationHandler;
pub use join::{JoinHandler, JoinSide};
pub use network_sink::NetworkSinkHandler;
pub use network_source::NetworkSourceHandler;
pub use statistic::StatisticHandler;

use crate::error::{Result, RuntimeError};

/// How a plan, channel, or handler is being torn down. Shared with the
/// wire format's `terminationType` field (§6) so an `EventFrame` carries
/// the same value a handler's `stop` receives.
pub use crate::network::wire::TerminationType;

/// One of the five handler variants in the core catalog (§4.7).
pub enum HandlerVariant {
    Aggregation(AggregationHandler),
    Join(JoinHandler),
    NetworkSource(NetworkSourceHandler),
    NetworkSink(NetworkSinkHandler),
    Statistic(StatisticHandler),
}

impl HandlerVariant {
    pub fn start(&self) -> Result<()> {
        match self {
            HandlerVariant::Aggregation(h) => h.start(),
            HandlerVariant::Join(h) => h.start(),
            HandlerVariant::NetworkSource(h) => h.start(),
            HandlerVariant::NetworkSink(h) => h.start(),
            HandlerVariant::Statistic(h) => h.start(),
        }
    }

    pub fn stop(&self, termination: TerminationType) -> Result<()> {
        match self {
            HandlerVariant::Aggregation(h) => h.stop(termination),
            HandlerVariant::Join(h) => h.stop(termination),
            HandlerVariant::NetworkSource(h) => h.stop(termination),
            HandlerVariant::NetworkSink(h) => h.stop(termination),
            HandlerVariant::Statistic(h) => h.stop(termination),
        }
    }

    pub fn as_aggregation(&self) -> Option<&AggregationHandler> {
        match self {
            HandlerVariant::Aggregation(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_join(&self) -> Option<&JoinHandler> {
        match self {
            HandlerVariant::Join(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_network_source(&self) -> Option<&NetworkSourceHandler> {
        match self {
            HandlerVariant::NetworkSource(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_network_sink(&self) -> Option<&NetworkSinkHandler> {
        match self {
            HandlerVariant::NetworkSink(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_statistic(&self) -> Option<&StatisticHandler> {
        match self {
            HandlerVariant::Statistic(h) => Some(h),
            _ => None,
        }
    }
}

/// Plan-owned, fixed-size vector of handlers. Pipelines reference handlers
/// only by index (`handlerIndex`), never by pointer, so the plan holds the
/// single owning list and operators cannot form ownership cycles with it.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<HandlerVariant>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Registers a handler and returns its stable index.
    pub fn register(&mut self, handler: HandlerVariant) -> usize {
        self.handlers.push(handler);
        self.handlers.len() - 1
    }

    pub fn get(&self, index: usize) -> Result<&HandlerVariant> {
        self.handlers
            .get(index)
            .ok_or(RuntimeError::HandlerNotFound(index))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Starts every registered handler, in registration order.
    pub fn start_all(&self) -> Result<()> {
        for handler in &self.handlers {
            handler.start()?;
        }
        Ok(())
    }

    /// Stops every registered handler, in reverse registration order.
    pub fn stop_all(&self, termination: TerminationType) -> Result<()> {
        for handler in self.handlers.iter().rev() {
            handler.stop(termination)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_index_is_handler_not_found() {
        let registry = HandlerRegistry::new();
        assert!(matches!(registry.get(0), Err(RuntimeError::HandlerNotFound(0))));
    }

    #[test]
    fn register_returns_stable_indices() {
        let mut registry = HandlerRegistry::new();
        let a = registry.register(HandlerVariant::Statistic(StatisticHandler::new(4)));
        let b = registry.register(HandlerVariant::Statistic(StatisticHandler::new(4)));
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert!(registry.get(a).unwrap().as_statistic().is_some());
    }
}
