use serde::Serialize;

/// Row in the `members` directory table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct MemberRow {
    pub member_id: i64,
    pub display_name: Option<String>,
    pub location: Option<String>,
    #[serde(skip)]
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberSearchPage {
    pub query: String,
    pub limit: u32,
    pub offset: u32,
    pub results: Vec<MemberRow>,
}
