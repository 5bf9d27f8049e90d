//! Security principals (users and groups) of deployed applications.

mod application;
pub mod comment;
mod lock;
mod provider;
mod state;
pub mod store;

pub use application::{
    ApplicationPrincipals, ConfigureSecurityPrincipalRequest, PrincipalInformation,
    PrincipalKind, PrincipalsSettings, SecurityPrincipal,
};
pub use lock::NamedLocks;
pub use provider::{PrincipalsProvider, PrincipalsProviderContext};
pub use state::PrincipalsState;
pub use store::{AccountStore, FileAccountStore, InMemoryAccountStore};
