use thiserror::Error;

/// Subject of an access grant, used to word contributor errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contributor {
    User,
    Group,
}

impl Contributor {
    fn noun(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Group => "group",
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("directory service error: {0}")]
    Directory(String),

    #[error("password hashing failed: {0}")]
    Hashing(String),

    #[error("invalid credential")]
    InvalidCredential,

    #[error("empty field")]
    EmptyField,

    #[error("too many connection attempts")]
    TooManyAttempts,

    #[error("the account is locked")]
    AccountLocked,

    #[error("wrong signature")]
    WrongSignature,

    #[error("signature doesn't match the user")]
    SignatureMismatch,

    #[error("user not found")]
    UserNotFound,

    #[error("repository not found")]
    RepoNotFound,

    #[error("only the repository owner can {0}")]
    NotRepoOwner(&'static str),

    #[error("group not found")]
    GroupNotFound,

    #[error("only the group owner can {0}")]
    NotGroupOwner(&'static str),

    #[error("permission denied")]
    PermissionDenied,

    #[error("the {} is already a contributor", .0.noun())]
    AlreadyContributor(Contributor),

    #[error("the {} is not a contributor", .0.noun())]
    NotContributor(Contributor),

    #[error("the user is already a member of the group")]
    AlreadyMember,

    #[error("the user is not a member of the group")]
    NotMember,

    #[error("the group owner cannot leave the group")]
    OwnerCannotLeave,

    #[error("the owner cannot be a contributor of their own repository")]
    OwnerAsContributor,

    #[error("token expired")]
    TokenExpired,

    #[error("the token only has read access")]
    TokenReadOnly,

    #[error("invalid token")]
    InvalidToken,

    #[error("token hash collision")]
    TokenHashCollision,

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("the password must contain at least 6 characters")]
    PasswordTooShort,

    #[error("the name is already taken")]
    NameTaken,

    #[error("registration is disabled")]
    RegistrationClosed,

    #[error("password authentication is disabled for this transfer, use a token")]
    PasswordNotAllowed,

    #[error("wrong code")]
    WrongCode,

    #[error("no second factor is pending for this session")]
    NoPendingOtp,

    #[error("second factor is already enabled")]
    OtpAlreadyEnabled,

    #[error("second factor is not enabled")]
    OtpNotEnabled,
}

impl Error {
    /// True for driver-level failures whose details must not reach users.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::Database(_)
                | Self::Io(_)
                | Self::Git(_)
                | Self::Config(_)
                | Self::Directory(_)
                | Self::Hashing(_)
                | Self::TokenHashCollision
        )
    }

    /// Short stable wording shown to users. Internal failures are logged here
    /// and collapsed to "unexpected error".
    #[must_use]
    pub fn public_message(&self) -> String {
        if self.is_internal() {
            tracing::error!("{self}");
            return "unexpected error".to_string();
        }
        self.to_string()
    }

    /// True when the failure is a credential rejection that must not be
    /// disambiguated further.
    #[must_use]
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredential
                | Self::TooManyAttempts
                | Self::AccountLocked
                | Self::InvalidToken
                | Self::TokenExpired
                | Self::TokenReadOnly
                | Self::PasswordNotAllowed
                | Self::WrongCode
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contributor_wording() {
        assert_eq!(
            Error::AlreadyContributor(Contributor::User).to_string(),
            "the user is already a contributor"
        );
        assert_eq!(
            Error::NotContributor(Contributor::Group).to_string(),
            "the group is not a contributor"
        );
    }

    #[test]
    fn test_internal_errors_are_masked() {
        let err = Error::Config("secret detail".into());
        assert!(err.is_internal());
        assert_eq!(err.public_message(), "unexpected error");

        let err = Error::NotRepoOwner("delete it");
        assert_eq!(err.public_message(), "only the repository owner can delete it");
    }
}
