//! CMS (PKCS#7) signature certificate extraction

use std::fmt;

use chrono::{DateTime, Utc};
use cryptographic_message_syntax::SignedData;
use serde::Serialize;
use tracing::debug;
use x509_certificate::rfc3280::AttributeTypeAndValue;

use crate::formats::macho::types::{MachError, Result};

/// Certificate fields reported for each entry of the signer chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Certificate {
    pub issuer_org: Option<String>,
    pub issuer_ou: Option<String>,
    pub subject_cn: Option<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl Certificate {
    /// Issuer label: the organizational unit when present, else the organization
    pub fn issuer_label(&self) -> Option<&str> {
        self.issuer_ou.as_deref().or(self.issuer_org.as_deref())
    }

    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.not_before <= at && at <= self.not_after
    }
}

impl fmt::Display for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} thru {})\n\tIssuer: {}",
            self.subject_cn.as_deref().unwrap_or("<no common name>"),
            self.not_before.format("%Y-%m-%d"),
            self.not_after.format("%Y-%m-%d"),
            self.issuer_label().unwrap_or("<unknown>")
        )
    }
}

/// Decode the `SignedData` in `der` and list its certificates in order.
pub fn parse_certificates(der: &[u8]) -> Result<Vec<Certificate>> {
    let signed = SignedData::parse_ber(der).map_err(|e| MachError::Cms(e.to_string()))?;

    let certificates: Vec<Certificate> = signed
        .certificates()
        .map(|cert| {
            let issuer = cert.issuer_name();
            Certificate {
                issuer_org: first_attribute(issuer.iter_organization()),
                issuer_ou: first_attribute(issuer.iter_organizational_unit()),
                subject_cn: cert.subject_common_name(),
                not_before: cert.validity_not_before(),
                not_after: cert.validity_not_after(),
            }
        })
        .collect();
    debug!(count = certificates.len(), "cms certificates");
    Ok(certificates)
}

fn first_attribute<'a, I>(mut values: I) -> Option<String>
where
    I: Iterator<Item = &'a AttributeTypeAndValue>,
{
    values.find_map(|atv| atv.to_string().ok())
}
