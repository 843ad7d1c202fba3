pub mod access;
mod authenticator;
mod csrf;
mod directory;
mod guard;
pub mod otp;
mod password;
mod session;
mod token;

pub use authenticator::{Authenticator, Backend, LoginOutcome};
pub use csrf::CsrfGuard;
pub use directory::{BindOutcome, DirectoryBind, LdapDirectory};
pub use guard::AttemptGuard;
pub use otp::{Enrolment, OtpEnrolments};
pub use password::PasswordHasher;
pub use session::{SessionCache, SessionState};
pub use token::{IssuedToken, TokenService, can_use_password, hash_token};
