//! Domain services.

pub mod coordinator;
pub mod federation_client;
pub mod flow_service;
pub mod import_service;
pub mod naming;
pub mod port_picker;
pub mod reconciler;
pub mod session_registry;
pub mod share_service;
pub mod wire_crypto;
