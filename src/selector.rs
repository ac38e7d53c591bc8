use crate::descriptor::RequestDescriptor;
use crate::error::Error;
use crate::mock::{Mock, MockRegistry};
use crate::mode::ExecutionMode;
use crate::pipeline::RequestPipeline;
use crate::request::WireRequest;

/// What the scheduler runs for one submission.
#[derive(Debug)]
pub(crate) enum OperationSpec {
    Live {
        descriptor: RequestDescriptor,
        request: WireRequest,
    },
    /// `descriptor` is the mock's own descriptor after the rewrite hook.
    Simulated {
        descriptor: RequestDescriptor,
        request: WireRequest,
        mock: Mock,
    },
}

impl OperationSpec {
    pub(crate) fn request(&self) -> &WireRequest {
        match self {
            Self::Live { request, .. } | Self::Simulated { request, .. } => request,
        }
    }

    pub(crate) fn is_simulated(&self) -> bool {
        matches!(self, Self::Simulated { .. })
    }
}

pub(crate) struct TransportSelector<'a> {
    mocks: &'a MockRegistry,
    pipeline: &'a RequestPipeline,
}

impl<'a> TransportSelector<'a> {
    pub(crate) fn new(mocks: &'a MockRegistry, pipeline: &'a RequestPipeline) -> Self {
        Self { mocks, pipeline }
    }

    /// `identity` is the submitted descriptor (pre-rewrite) whose key selects
    /// the mock; `rewritten` and `request` come from the pipeline.
    pub(crate) fn select(
        &self,
        identity: &RequestDescriptor,
        rewritten: RequestDescriptor,
        request: WireRequest,
        execution_mode: ExecutionMode,
    ) -> crate::Result<OperationSpec> {
        let live = |descriptor, request| OperationSpec::Live {
            descriptor,
            request,
        };

        match execution_mode {
            ExecutionMode::Live => Ok(live(rewritten, request)),
            ExecutionMode::PartialSimulation => match self.mocks.get(&identity.key()) {
                Some(mock) => Ok(self.simulated(mock, request)),
                None => Ok(live(rewritten, request)),
            },
            ExecutionMode::ForcedSimulation => match self.mocks.get(&identity.key()) {
                Some(mock) => Ok(self.simulated(mock, request)),
                None => Err(Error::NoMockProvided {
                    method: identity.method().clone(),
                    path: identity.path().to_owned(),
                    key: identity.key(),
                }),
            },
        }
    }

    fn simulated(&self, mock: Mock, request: WireRequest) -> OperationSpec {
        let descriptor = self.pipeline.rewrite(mock.descriptor().clone());
        OperationSpec::Simulated {
            descriptor,
            request,
            mock,
        }
    }
}
