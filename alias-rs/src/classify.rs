//! Inbound domain classification
//!
//! Decides which routing path an envelope recipient takes, based on its
//! domain alone (plus the custom domain registry).

use crate::config::ServiceConfig;
use crate::error::Result;
use crate::model::Domain;
use crate::store::AliasStore;

#[derive(Debug, Clone, PartialEq)]
pub enum DomainKind {
    /// `<alias-id>@unsubscribe.<base>`; the local part is the alias id
    Unsubscribe { local_part: String },
    /// `<username>.<base>`, or the bare base domain owned by the admin
    StandardUser { username: String, domain: String },
    CustomDomain(Domain),
    Unroutable,
}

pub struct DomainClassifier {
    base_domains: Vec<String>,
    admin_username: Option<String>,
    unsubscribe_label: String,
}

impl DomainClassifier {
    pub fn new(service: &ServiceConfig) -> Self {
        Self {
            base_domains: service
                .domains
                .iter()
                .map(|d| d.trim().to_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
            admin_username: service
                .admin_username
                .as_ref()
                .map(|u| u.trim().to_lowercase())
                .filter(|u| !u.is_empty()),
            unsubscribe_label: service.unsubscribe_label.to_lowercase(),
        }
    }

    /// Classify against the configured base domains only
    ///
    /// Returns [`DomainKind::Unroutable`] for anything that is not a base
    /// domain form; custom domains are resolved by [`Self::classify`].
    pub fn classify_base(&self, domain: &str, local_part: &str) -> DomainKind {
        let domain = domain.trim().trim_end_matches('.').to_lowercase();

        for base in &self.base_domains {
            if domain == *base {
                return match &self.admin_username {
                    Some(admin) => DomainKind::StandardUser {
                        username: admin.clone(),
                        domain,
                    },
                    None => DomainKind::Unroutable,
                };
            }

            let Some(label) = domain
                .strip_suffix(base.as_str())
                .and_then(|rest| rest.strip_suffix('.'))
            else {
                continue;
            };

            if label.is_empty() || label.contains('.') {
                continue;
            }

            if label == self.unsubscribe_label {
                return DomainKind::Unsubscribe {
                    local_part: local_part.to_string(),
                };
            }

            return DomainKind::StandardUser {
                username: label.to_string(),
                domain,
            };
        }

        DomainKind::Unroutable
    }

    pub async fn classify(
        &self,
        store: &dyn AliasStore,
        domain: &str,
        local_part: &str,
    ) -> Result<DomainKind> {
        let kind = self.classify_base(domain, local_part);
        if kind != DomainKind::Unroutable {
            return Ok(kind);
        }

        let domain = domain.trim().trim_end_matches('.').to_lowercase();
        Ok(match store.find_verified_domain(&domain).await? {
            Some(record) if record.is_routable() => DomainKind::CustomDomain(record),
            _ => DomainKind::Unroutable,
        })
    }
}
