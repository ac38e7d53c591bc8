use std::num::NonZeroUsize;

/// Concurrency bound applied by the operation scheduler to newly submitted
/// work.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConcurrencyMode {
    /// One operation at a time, admitted and completed in submission order.
    Synchronous,
    #[default]
    Asynchronous,
    Bounded(NonZeroUsize),
}

impl ConcurrencyMode {
    /// Builds a bounded mode; a zero bound is raised to one.
    pub fn bounded(limit: usize) -> Self {
        Self::Bounded(NonZeroUsize::new(limit).unwrap_or(NonZeroUsize::MIN))
    }

    /// Maximum number of operations executing at once, `None` when unbounded.
    pub const fn max_in_flight(self) -> Option<usize> {
        match self {
            Self::Synchronous => Some(1),
            Self::Asynchronous => None,
            Self::Bounded(limit) => Some(limit.get()),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synchronous => "synchronous",
            Self::Asynchronous => "asynchronous",
            Self::Bounded(_) => "bounded",
        }
    }
}

/// Testing toggle deciding between the live transport and registered mocks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    #[default]
    Live,
    /// Use a registered mock when one exists, otherwise go live.
    PartialSimulation,
    /// Require a registered mock; submissions without one fail.
    ForcedSimulation,
}

impl ExecutionMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::PartialSimulation => "partial_simulation",
            Self::ForcedSimulation => "forced_simulation",
        }
    }
}
