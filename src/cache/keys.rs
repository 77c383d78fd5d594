//! Query keys for the clinic's backend resources.

use chrono::NaiveDate;
use sha2::{Digest, Sha256};

use super::traits::QueryKey;

/// Query key types for clinic resources.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClinicQueryKey {
  /// Patient list, optionally filtered by a search term
  Patients { search: Option<String> },
  /// A single patient record
  Patient { id: String },
  /// Appointments, optionally for one day or one patient
  Appointments {
    date: Option<NaiveDate>,
    patient_id: Option<String>,
  },
  /// Financial transactions for a month ("2026-10")
  Transactions { month: String },
  /// Exercise library
  Exercises { category: Option<String> },
  /// Prescriptions issued to a patient
  Prescriptions { patient_id: String },
  /// Knowledge base articles matching a query
  KnowledgeBase { query: Option<String> },
}

impl ClinicQueryKey {
  /// Resource name; every key of a resource shares it as its key prefix.
  pub fn resource(&self) -> &'static str {
    match self {
      Self::Patients { .. } => "patients",
      Self::Patient { .. } => "patient",
      Self::Appointments { .. } => "appointments",
      Self::Transactions { .. } => "transactions",
      Self::Exercises { .. } => "exercises",
      Self::Prescriptions { .. } => "prescriptions",
      Self::KnowledgeBase { .. } => "knowledge_base",
    }
  }

  /// Normalized parameter string hashed into the key
  fn params(&self) -> String {
    match self {
      Self::Patients { search } => normalize(search.as_deref()),
      Self::Patient { id } => id.trim().to_string(),
      Self::Appointments { date, patient_id } => format!(
        "{}|{}",
        date.map(|d| d.to_string()).unwrap_or_default(),
        patient_id.as_deref().map(str::trim).unwrap_or_default()
      ),
      Self::Transactions { month } => month.trim().to_string(),
      Self::Exercises { category } => normalize(category.as_deref()),
      Self::Prescriptions { patient_id } => patient_id.trim().to_string(),
      Self::KnowledgeBase { query } => normalize(query.as_deref()),
    }
  }
}

impl QueryKey for ClinicQueryKey {
  fn cache_key(&self) -> String {
    // SHA256 hash for stable, fixed-length keys; the readable prefix keeps
    // whole resources addressable for invalidation.
    let mut hasher = Sha256::new();
    hasher.update(self.params().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}:{}", self.resource(), &digest[..16])
  }

  fn description(&self) -> String {
    match self {
      Self::Patients { search: Some(s) } => format!("patients matching '{}'", s),
      Self::Patients { search: None } => "all patients".to_string(),
      Self::Patient { id } => format!("patient {}", id),
      Self::Appointments { date, patient_id } => match (date, patient_id) {
        (Some(d), Some(p)) => format!("appointments on {} for patient {}", d, p),
        (Some(d), None) => format!("appointments on {}", d),
        (None, Some(p)) => format!("appointments for patient {}", p),
        (None, None) => "all appointments".to_string(),
      },
      Self::Transactions { month } => format!("transactions for {}", month),
      Self::Exercises { category: Some(c) } => format!("{} exercises", c),
      Self::Exercises { category: None } => "all exercises".to_string(),
      Self::Prescriptions { patient_id } => format!("prescriptions for patient {}", patient_id),
      Self::KnowledgeBase { query: Some(q) } => format!("articles matching '{}'", q),
      Self::KnowledgeBase { query: None } => "knowledge base".to_string(),
    }
  }
}

/// Trim and lowercase free-text filters so equivalent searches share a key.
fn normalize(text: Option<&str>) -> String {
  text.map(|t| t.trim().to_lowercase()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_equivalent_searches_share_a_key() {
    let a = ClinicQueryKey::Patients {
      search: Some("  Silva ".into()),
    };
    let b = ClinicQueryKey::Patients {
      search: Some("silva".into()),
    };
    assert_eq!(a.cache_key(), b.cache_key());
  }

  #[test]
  fn test_keys_carry_resource_prefix() {
    let key = ClinicQueryKey::Appointments {
      date: NaiveDate::from_ymd_opt(2026, 10, 17),
      patient_id: None,
    };
    let cache_key = key.cache_key();
    assert!(cache_key.starts_with("appointments:"));
    assert_eq!(cache_key.len(), "appointments:".len() + 16);
    assert_eq!(key.description(), "appointments on 2026-10-17");
  }

  #[test]
  fn test_different_params_give_different_keys() {
    let oct = ClinicQueryKey::Transactions {
      month: "2026-10".into(),
    };
    let nov = ClinicQueryKey::Transactions {
      month: "2026-11".into(),
    };
    assert_ne!(oct.cache_key(), nov.cache_key());
  }
}
