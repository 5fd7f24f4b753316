pub mod config;
pub mod environment;
pub mod error;
pub mod orchestrator;
pub mod participant;
pub mod protocol;
pub mod server;

pub use environment::{
    Environment, EnvironmentFactory, Evaluation, Invocation, Observation, TaskEnvironment,
    TaskEnvironmentFactory, Trace,
};
pub use error::{DomainStepError, EnvironmentError, SchemaError, TransportError};
pub use orchestrator::{AssessmentOrchestrator, AssessmentStream};
pub use participant::{HttpParticipant, Participant, ScriptedParticipant};
pub use protocol::{
    Artifact, ArtifactContent, ArtifactKind, AssessmentConfig, AssessmentEvent,
    AssessmentRequest, ErrorKind, ErrorReport, EvaluationReport, ParticipantAction,
    RemoteMessage, RunDefaults, TaskUpdate, Termination,
};
pub use server::{router, AppState};
