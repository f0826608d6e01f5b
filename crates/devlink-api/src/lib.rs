// devlink-api: Async collaborators for the device cloud (REST, user service, LAN contract)

pub mod auth;
pub mod cloud;
pub mod error;
pub mod lan;
pub mod models;
pub mod transport;
pub mod user;

pub use auth::{AppCredentials, Authenticator, Credentials, SessionToken};
pub use cloud::{CloudApi, CloudClient};
pub use error::Error;
pub use lan::{LanLink, LanTarget};
pub use models::{DatapointRecord, DeviceRecord, LanConfigRecord, NewDatapoint, PropertyRecord};
pub use transport::{TlsMode, TransportConfig};
pub use user::UserClient;
