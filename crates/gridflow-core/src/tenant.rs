// Copyright 2025 DataStax Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier of a market-participant organization.
///
/// The tenant is the isolation unit: every workflow instance, event, and
/// bookmark is owned by exactly one tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(Uuid);

impl TenantId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Onboarding,
    Active,
    Inactive,
    Suspended,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Onboarding => "onboarding",
            TenantStatus::Active => "active",
            TenantStatus::Inactive => "inactive",
            TenantStatus::Suspended => "suspended",
        }
    }
}

impl std::fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TenantStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "onboarding" => Ok(TenantStatus::Onboarding),
            "active" => Ok(TenantStatus::Active),
            "inactive" => Ok(TenantStatus::Inactive),
            "suspended" => Ok(TenantStatus::Suspended),
            _ => Err(format!("unknown tenant status: {s}")),
        }
    }
}

/// A market-participant organization.
///
/// The identifier is immutable; only the status changes over the tenant's
/// lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub status: TenantStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Tenant {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: TenantId::new(),
            name: name.into(),
            status: TenantStatus::Onboarding,
            created_at: chrono::Utc::now(),
        }
    }

    /// Whether workflows may be created for this tenant.
    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }
}

/// Business classification of a tenant's market participation.
///
/// The market role selects which workflow templates apply to a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketRole {
    /// Balance responsible party
    Brp,
    /// Balancing service provider
    Bsp,
    /// Grid user
    Gu,
    /// Access contract holder
    Ach,
    /// Congestion rebalancing market participant
    Crm,
    /// Energy service provider
    Esp,
    /// Distribution system operator
    Dso,
    /// Transmission system operator
    Tso,
    /// Scheduling agent
    Sa,
    /// Outage planning agent
    Opa,
    /// Voltage service provider
    Vsp,
}

impl MarketRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketRole::Brp => "BRP",
            MarketRole::Bsp => "BSP",
            MarketRole::Gu => "GU",
            MarketRole::Ach => "ACH",
            MarketRole::Crm => "CRM",
            MarketRole::Esp => "ESP",
            MarketRole::Dso => "DSO",
            MarketRole::Tso => "TSO",
            MarketRole::Sa => "SA",
            MarketRole::Opa => "OPA",
            MarketRole::Vsp => "VSP",
        }
    }
}

impl std::fmt::Display for MarketRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MarketRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BRP" => Ok(MarketRole::Brp),
            "BSP" => Ok(MarketRole::Bsp),
            "GU" => Ok(MarketRole::Gu),
            "ACH" => Ok(MarketRole::Ach),
            "CRM" => Ok(MarketRole::Crm),
            "ESP" => Ok(MarketRole::Esp),
            "DSO" => Ok(MarketRole::Dso),
            "TSO" => Ok(MarketRole::Tso),
            "SA" => Ok(MarketRole::Sa),
            "OPA" => Ok(MarketRole::Opa),
            "VSP" => Ok(MarketRole::Vsp),
            _ => Err(format!("unknown market role: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_market_role_round_trip() {
        let role = MarketRole::Brp;
        let json = serde_json::to_string(&role).unwrap();
        assert_eq!(json, "\"BRP\"");

        let deserialized: MarketRole = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, role);
    }

    #[test]
    fn test_market_role_from_str() {
        assert_eq!("brp".parse::<MarketRole>().unwrap(), MarketRole::Brp);
        assert_eq!("TSO".parse::<MarketRole>().unwrap(), MarketRole::Tso);
        assert!("XYZ".parse::<MarketRole>().is_err());
    }

    #[test]
    fn test_tenant_active() {
        let mut tenant = Tenant::new("Engie");
        assert!(!tenant.is_active());
        tenant.status = TenantStatus::Active;
        assert!(tenant.is_active());
    }

    #[test]
    fn test_tenant_status_serialization() {
        let status = TenantStatus::Suspended;
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, "\"suspended\"");
    }
}
