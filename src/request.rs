//! Validated analysis request.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Horizon {
    Short,
    Medium,
    Long,
}

impl Horizon {
    pub fn as_str(&self) -> &'static str {
        match self {
            Horizon::Short => "short",
            Horizon::Medium => "medium",
            Horizon::Long => "long",
        }
    }
}

impl FromStr for Horizon {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "short" => Ok(Horizon::Short),
            "medium" => Ok(Horizon::Medium),
            "long" => Ok(Horizon::Long),
            _ => Err(ValidationError::InvalidHorizon(s.to_string())),
        }
    }
}

impl fmt::Display for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskProfile {
    Conservative,
    Moderate,
    Aggressive,
}

impl RiskProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskProfile::Conservative => "conservative",
            RiskProfile::Moderate => "moderate",
            RiskProfile::Aggressive => "aggressive",
        }
    }
}

impl FromStr for RiskProfile {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "conservative" => Ok(RiskProfile::Conservative),
            "moderate" => Ok(RiskProfile::Moderate),
            "aggressive" => Ok(RiskProfile::Aggressive),
            _ => Err(ValidationError::InvalidRiskProfile(s.to_string())),
        }
    }
}

impl fmt::Display for RiskProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw request body as posted by clients. All fields optional so that missing
/// ones can be reported together.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalyzeBody {
    #[serde(default)]
    pub ticker: Option<String>,
    #[serde(default)]
    pub horizon: Option<String>,
    #[serde(default)]
    pub risk_profile: Option<String>,
}

/// Immutable, canonicalised request: ticker upper-cased, enums parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalysisRequest {
    pub ticker: String,
    pub horizon: Horizon,
    pub risk_profile: RiskProfile,
}

impl AnalysisRequest {
    pub fn new(ticker: &str, horizon: Horizon, risk_profile: RiskProfile) -> Result<Self, ValidationError> {
        let ticker = ticker.trim();
        if ticker.is_empty() {
            return Err(ValidationError::EmptyTicker);
        }
        Ok(Self {
            ticker: ticker.to_ascii_uppercase(),
            horizon,
            risk_profile,
        })
    }

    /// Positional arguments handed to the analysis program.
    pub fn args(&self) -> [String; 3] {
        [
            self.ticker.clone(),
            self.horizon.as_str().to_string(),
            self.risk_profile.as_str().to_string(),
        ]
    }
}

impl TryFrom<AnalyzeBody> for AnalysisRequest {
    type Error = ValidationError;

    fn try_from(body: AnalyzeBody) -> Result<Self, Self::Error> {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());

        let mut missing = Vec::new();
        if !present(&body.ticker) {
            missing.push("ticker");
        }
        if !present(&body.horizon) {
            missing.push("horizon");
        }
        if !present(&body.risk_profile) {
            missing.push("risk_profile");
        }
        if !missing.is_empty() {
            return Err(ValidationError::MissingFields(missing));
        }

        let horizon: Horizon = body.horizon.as_deref().unwrap_or_default().parse()?;
        let risk_profile: RiskProfile = body.risk_profile.as_deref().unwrap_or_default().parse()?;
        AnalysisRequest::new(body.ticker.as_deref().unwrap_or_default(), horizon, risk_profile)
    }
}
