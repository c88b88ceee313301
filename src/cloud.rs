//! Cloud side of provisioning: bootstrapping the device against AWS IoT,
//! looking up the identity it was given, and registering that identity.

mod backend;
mod provisioner;
mod registrar;

pub use backend::{AwsCli, CloudBackend, CloudError, CloudIdentity};
pub use provisioner::{extract_identity_token, provision_device, ProvisionError};
pub use registrar::{register_device, RegistrationReport};
