//! 身份管理模块
//!
//! 该模块负责服务身份的完整生命周期：由拓扑推导主体、向 KDC 供应 keytab、
//! 向 CA 申请证书，并将凭据绑定到具体的任务实例。

mod binder;
mod issuer;
mod provisioner;
mod registry;

pub use binder::{
    BinderConfig, BindingLedger, BindingMaterial, BindingState, IdentityBinder, Reservation,
    CA_BUNDLE_FILE, CERT_FILE, KEY_FILE,
};
pub use issuer::{CertificateIssuer, CertificateRotated, IssuerConfig};
pub use provisioner::{CredentialProvisioner, ProvisionerConfig};
pub use registry::{PrincipalDiff, PrincipalRegistry};
