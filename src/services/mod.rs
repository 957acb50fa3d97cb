pub mod audit;
pub mod auth;
pub mod rbac;
pub mod resolver;
pub mod revocation;
pub mod users;

pub use audit::AuditTrail;
pub use auth::AuthService;
pub use rbac::RbacService;
pub use resolver::PermissionResolver;
pub use revocation::RevocationStore;
pub use users::UserService;
