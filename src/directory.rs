use async_trait::async_trait;
use dashmap::DashMap;

use crate::model::StudentProfile;
use crate::store::StoreError;

/// Read-only lookup into the identity provider.
#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn get_student_profile(&self, student_id: &str) -> Result<StudentProfile, StoreError>;
}

/// In-process directory fed by `register_student` requests.
#[derive(Default)]
pub struct StudentDirectory {
    profiles: DashMap<String, StudentProfile>,
}

impl StudentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, profile: StudentProfile) {
        self.profiles.insert(profile.id.clone(), profile);
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[async_trait]
impl ProfileDirectory for StudentDirectory {
    async fn get_student_profile(&self, student_id: &str) -> Result<StudentProfile, StoreError> {
        self.profiles
            .get(student_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::NotFound(student_id.to_string()))
    }
}
