use std::fmt;
use std::str::FromStr;
use tonic::metadata::MetadataMap;
use tonic::Status;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";
pub const USER_EMAIL_HEADER: &str = "x-user-email";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "client" | "cliente" => Ok(Role::Client),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// Authenticated caller, as asserted by the gateway in front of this service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub user_id: String,
    pub role: Role,
    pub email: Option<String>,
}

impl CallerIdentity {
    pub fn client(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: Role::Client,
            email: None,
        }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: Role::Admin,
            email: None,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Read the identity headers. A missing user id or role is unauthenticated.
    pub fn from_metadata(metadata: &MetadataMap) -> Result<Self, Status> {
        let user_id = header(metadata, USER_ID_HEADER)?
            .ok_or_else(|| Status::unauthenticated("missing caller identity"))?;
        let role = header(metadata, USER_ROLE_HEADER)?
            .ok_or_else(|| Status::unauthenticated("missing caller role"))?
            .parse::<Role>()
            .map_err(Status::unauthenticated)?;
        let email = header(metadata, USER_EMAIL_HEADER)?;

        Ok(Self { user_id, role, email })
    }
}

fn header(metadata: &MetadataMap, key: &str) -> Result<Option<String>, Status> {
    match metadata.get(key) {
        None => Ok(None),
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| Status::unauthenticated(format!("{key} is not valid ASCII")))?
                .trim();
            Ok((!value.is_empty()).then(|| value.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    fn metadata(pairs: &[(&'static str, &'static str)]) -> MetadataMap {
        let mut metadata = MetadataMap::new();
        for (key, value) in pairs {
            metadata.insert(*key, value.parse().unwrap());
        }
        metadata
    }

    #[test]
    fn test_reads_identity_headers() {
        let identity = CallerIdentity::from_metadata(&metadata(&[
            ("x-user-id", "client-1"),
            ("x-user-role", "Cliente"),
            ("x-user-email", "ana@example.com"),
        ]))
        .unwrap();

        assert_eq!(identity.user_id, "client-1");
        assert_eq!(identity.role, Role::Client);
        assert_eq!(identity.email.as_deref(), Some("ana@example.com"));
    }

    #[test]
    fn test_missing_or_unknown_identity_is_unauthenticated() {
        let missing = CallerIdentity::from_metadata(&metadata(&[("x-user-role", "admin")])).unwrap_err();
        assert_eq!(missing.code(), Code::Unauthenticated);

        let unknown =
            CallerIdentity::from_metadata(&metadata(&[("x-user-id", "u1"), ("x-user-role", "root")])).unwrap_err();
        assert_eq!(unknown.code(), Code::Unauthenticated);
    }
}
