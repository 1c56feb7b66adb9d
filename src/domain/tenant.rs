use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub email: String,
    pub password_hash: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Class {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Student {
    pub id: String,
    pub tenant_id: Option<String>,
    pub name: String,
    pub external_id: String,
    pub overall_grade_cache: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentClassMembership {
    pub id: String,
    pub student_id: String,
    pub class_id: String,
}
