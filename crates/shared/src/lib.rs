//! Wire protocol types and error taxonomy shared by the hubwire client.

pub mod error;
pub mod protocol;

pub use error::{ClientError, HubError};
pub use protocol::{
    HubInvocation, HubRegistration, HubResult, HubServerInvocation, NegotiationResponse,
    ReceivedEnvelope, PROTOCOL_VERSION,
};
