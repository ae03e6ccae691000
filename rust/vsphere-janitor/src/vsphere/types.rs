//! Subset of the vSphere VI/JSON data model the janitor reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedObjectReference {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl ManagedObjectReference {
    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceContent {
    pub session_manager: Option<ManagedObjectReference>,
    pub search_index: ManagedObjectReference,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest<'a> {
    pub user_name: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FindByInventoryPathRequest<'a> {
    pub inventory_path: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryConfig {
    pub name: Option<String>,
    pub instance_uuid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryRuntime {
    pub power_state: PowerState,
    pub boot_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickStats {
    pub uptime_seconds: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSummary {
    pub config: Option<SummaryConfig>,
    pub runtime: SummaryRuntime,
    #[serde(default)]
    pub quick_stats: QuickStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    Queued,
    Running,
    Success,
    Error,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalizedMethodFault {
    pub localized_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub state: TaskState,
    pub error: Option<LocalizedMethodFault>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_summary() {
        let json = r#"{
            "_typeName": "VirtualMachineSummary",
            "config": {
                "_typeName": "VirtualMachineConfigSummary",
                "name": "travis-job-1234",
                "uuid": "4203a1b2-0000-0000-0000-000000000000",
                "instanceUuid": "5003c4d5-0000-0000-0000-000000000000"
            },
            "runtime": {
                "_typeName": "VirtualMachineRuntimeInfo",
                "powerState": "poweredOn",
                "bootTime": "2016-01-15T10:00:00Z"
            },
            "quickStats": {
                "_typeName": "VirtualMachineQuickStats",
                "uptimeSeconds": 7200
            }
        }"#;

        let summary: VirtualMachineSummary = serde_json::from_str(json).unwrap();
        let config = summary.config.unwrap();

        assert_eq!(config.name.as_deref(), Some("travis-job-1234"));
        assert_eq!(
            config.instance_uuid.as_deref(),
            Some("5003c4d5-0000-0000-0000-000000000000")
        );
        assert_eq!(summary.runtime.power_state, PowerState::PoweredOn);
        assert!(summary.runtime.boot_time.is_some());
        assert_eq!(summary.quick_stats.uptime_seconds, Some(7200));
    }

    #[test]
    fn test_decode_unbooted_summary() {
        let json = r#"{
            "runtime": { "powerState": "poweredOff" },
            "quickStats": {}
        }"#;

        let summary: VirtualMachineSummary = serde_json::from_str(json).unwrap();

        assert!(summary.config.is_none());
        assert_eq!(summary.runtime.power_state, PowerState::PoweredOff);
        assert_eq!(summary.runtime.boot_time, None);
        assert_eq!(summary.quick_stats.uptime_seconds, None);
    }

    #[test]
    fn test_decode_task_info() {
        let json = r#"{
            "state": "error",
            "error": { "localizedMessage": "The attempted operation cannot be performed in the current state (Powered off)." }
        }"#;

        let info: TaskInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.state, TaskState::Error);
        assert!(info.error.unwrap().localized_message.unwrap().contains("Powered off"));
    }

    #[test]
    fn test_decode_moref() {
        let json = r#"{"_typeName":"ManagedObjectReference","type":"Folder","value":"group-v3"}"#;
        let moref: ManagedObjectReference = serde_json::from_str(json).unwrap();

        assert!(moref.is("Folder"));
        assert_eq!(moref.value, "group-v3");
    }
}
