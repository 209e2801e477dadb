/// Device-description document parsing.
pub mod device_description;
/// SCPD document parsing: actions and state variables.
pub mod service_description;
