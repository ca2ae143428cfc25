use serde::{Deserialize, Serialize};

/// Address used to reach the primary. An empty URL means no primary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrimaryInfo {
    #[serde(rename = "advertiseURL", default)]
    pub advertise_url: String,
}

impl PrimaryInfo {
    pub fn new(advertise_url: impl Into<String>) -> Self {
        Self {
            advertise_url: advertise_url.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.advertise_url.is_empty()
    }
}

/// The replicated record: who is primary, plus where clients should be
/// redirected. The redirect target is independent of the advertise URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrimaryRedirectInfo {
    #[serde(flatten)]
    pub primary: PrimaryInfo,

    #[serde(rename = "redirectURL", default)]
    pub redirect_url: String,
}

impl PrimaryRedirectInfo {
    pub fn new(advertise_url: impl Into<String>, redirect_url: impl Into<String>) -> Self {
        Self {
            primary: PrimaryInfo::new(advertise_url),
            redirect_url: redirect_url.into(),
        }
    }

    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Read-only view of the last primary this node has applied, without a
/// consensus round-trip.
pub trait PrimaryProvider: Send + Sync + std::fmt::Debug {
    fn primary_redirect_info(&self) -> PrimaryRedirectInfo;

    fn primary_info(&self) -> PrimaryInfo {
        self.primary_redirect_info().primary
    }

    fn redirect_url(&self) -> String {
        self.primary_redirect_info().redirect_url
    }
}
