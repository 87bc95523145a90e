use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    // Declaration order doubles as tie-break priority: admins sort first.
    Admin,
    Member,
}

impl MemberRole {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "admin" => Some(MemberRole::Admin),
            "member" => Some(MemberRole::Member),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MemberRole::Admin => "admin",
            MemberRole::Member => "member",
        }
    }
}

impl TryFrom<String> for MemberRole {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("Invalid member role: {}", value))
    }
}

/// One member of the household a user belongs to.
///
/// A user without a household is reported as a single member with no
/// `household_id` and the admin role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HouseholdMember {
    pub household_id: Option<String>,
    pub user_id: String,
    pub role: MemberRole,
}

impl HouseholdMember {
    pub fn solo(user_id: &str) -> Self {
        Self {
            household_id: None,
            user_id: user_id.to_string(),
            role: MemberRole::Admin,
        }
    }
}

/// The pub/sub scope key for a user's household.
pub fn household_key(household_id: Option<&str>, user_id: &str) -> String {
    match household_id {
        Some(id) => format!("household:{}", id),
        None => format!("user:{}", user_id),
    }
}
