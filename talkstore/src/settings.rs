//! Default site settings seeded into an empty `settings` collection.

use serde_json::{json, Value};

use crate::document::Fields;

/// Default site name.
pub const SITE_NAME_DEFAULT: &str = "なんでもライトニングトーク";

/// Default public site URL.
pub const SITE_URL_DEFAULT: &str = "http://localhost:3000";

/// Default administrator address.
pub const ADMIN_EMAIL_DEFAULT: &str = "admin@example.com";

/// Talk categories offered by default.
pub const TALK_CATEGORIES_DEFAULT: [&str; 13] = [
    "tech", "hobby", "learning", "travel", "food", "game", "lifehack", "pet", "garden", "money",
    "sports", "music", "other",
];

/// Site-level values the settings document is seeded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteDefaults {
    /// Display name
    pub site_name: String,
    /// Public URL (`SITE_URL`)
    pub site_url: String,
    /// Administrator address (`ADMIN_EMAIL`)
    pub admin_email: String,
    /// Whether outbound email is on (`EMAIL_ENABLED=true`)
    pub email_enabled: bool,
}

impl Default for SiteDefaults {
    fn default() -> Self {
        Self {
            site_name: SITE_NAME_DEFAULT.to_string(),
            site_url: SITE_URL_DEFAULT.to_string(),
            admin_email: ADMIN_EMAIL_DEFAULT.to_string(),
            email_enabled: false,
        }
    }
}

impl SiteDefaults {
    /// The settings document written on first start.
    #[must_use]
    pub fn settings_document(&self) -> Fields {
        let value = json!({
            "siteName": self.site_name,
            "siteUrl": self.site_url,
            "adminEmail": self.admin_email,
            "emailEnabled": self.email_enabled,
            "analyticsEnabled": true,
            "registrationSettings": {
                "requireApproval": false,
                "allowWalkIn": true,
                "maxParticipants": 100,
                "autoConfirmation": true
            },
            "talkSettings": {
                "requireApproval": false,
                "allowLastMinute": true,
                "maxDuration": 5,
                "categories": TALK_CATEGORIES_DEFAULT
            },
            "notificationSettings": {
                "emailOnRegistration": true,
                "emailOnTalkSubmission": true,
                "reminderEmails": true,
                "reminderDays": [7, 1]
            }
        });
        match value {
            Value::Object(fields) => fields,
            _ => Fields::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_document_shape() {
        let site = SiteDefaults {
            email_enabled: true,
            ..SiteDefaults::default()
        };
        let doc = site.settings_document();

        assert_eq!(doc["siteName"], SITE_NAME_DEFAULT);
        assert_eq!(doc["emailEnabled"], true);
        assert_eq!(doc["registrationSettings"]["maxParticipants"], 100);
        assert_eq!(doc["talkSettings"]["categories"].as_array().unwrap().len(), 13);
        assert_eq!(doc["notificationSettings"]["reminderDays"], json!([7, 1]));
        assert!(!doc.contains_key("id"));
    }
}
