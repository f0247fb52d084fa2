//! The static table definitions. Column sets follow the Livestatus tables
//! served by the common monitoring cores; columns no core of interest
//! exposes anymore are left out.

use livestatus::DataType;

use super::{Column, Table, UpdateType};

struct TableBuilder {
    name: &'static str,
    columns: Vec<Column>,
    is_virtual: bool,
    passthrough_only: bool,
    group_by: bool,
    primary_key: &'static [&'static str],
}

impl TableBuilder {
    fn new(name: &'static str, primary_key: &'static [&'static str]) -> Self {
        Self {
            name,
            columns: Vec::new(),
            is_virtual: false,
            passthrough_only: false,
            group_by: false,
            primary_key,
        }
    }

    fn push(mut self, name: &'static str, data_type: DataType, update_type: UpdateType) -> Self {
        let index = self.columns.len();
        self.columns.push(Column {
            name,
            data_type,
            update_type,
            index,
            ref_table: None,
            ref_column: None,
            local_only: false,
        });
        self
    }

    fn stat(self, name: &'static str, data_type: DataType) -> Self {
        self.push(name, data_type, UpdateType::Static)
    }

    fn dyn_(self, name: &'static str, data_type: DataType) -> Self {
        self.push(name, data_type, UpdateType::Dynamic)
    }

    fn local(mut self, name: &'static str, data_type: DataType) -> Self {
        let index = self.columns.len();
        self.columns.push(Column {
            name,
            data_type,
            update_type: UpdateType::Virtual,
            index,
            ref_table: None,
            ref_column: None,
            local_only: true,
        });
        self
    }

    fn join(
        mut self,
        name: &'static str,
        data_type: DataType,
        ref_table: &'static str,
        ref_column: &'static str,
    ) -> Self {
        let index = self.columns.len();
        self.columns.push(Column {
            name,
            data_type,
            update_type: UpdateType::Ref,
            index,
            ref_table: Some(ref_table),
            ref_column: Some(ref_column),
            local_only: false,
        });
        self
    }

    /// The identity columns every fetched table carries.
    fn peer_columns(self) -> Self {
        self.local("peer_key", DataType::String)
            .local("peer_name", DataType::String)
            .local("lmd_last_cache_update", DataType::Time)
    }

    fn virtual_table(mut self) -> Self {
        self.is_virtual = true;
        self
    }

    fn passthrough(mut self) -> Self {
        self.passthrough_only = true;
        self
    }

    fn build(self) -> Table {
        Table::new(
            self.name,
            self.columns,
            self.is_virtual,
            self.passthrough_only,
            self.group_by,
            self.primary_key,
        )
    }
}

pub(super) fn build_tables() -> Vec<Table> {
    use DataType::*;
    vec![
        TableBuilder::new("hosts", &["name"])
            .stat("name", String)
            .stat("alias", String)
            .stat("display_name", String)
            .stat("address", String)
            .stat("check_command", String)
            .stat("check_period", String)
            .stat("notification_period", String)
            .stat("contacts", StringList)
            .stat("contact_groups", StringList)
            .stat("groups", StringList)
            .stat("parents", StringList)
            .stat("services", StringList)
            .stat("notes", String)
            .stat("notes_url", String)
            .stat("action_url", String)
            .stat("icon_image", String)
            .stat("icon_image_alt", String)
            .stat("max_check_attempts", Int)
            .stat("check_interval", Float)
            .stat("retry_interval", Float)
            .stat("custom_variable_names", StringList)
            .stat("custom_variable_values", StringList)
            .dyn_("custom_variables", CustomVariables)
            .dyn_("state", Int)
            .dyn_("state_type", Int)
            .dyn_("has_been_checked", Int)
            .dyn_("last_check", Time)
            .dyn_("last_state_change", Time)
            .dyn_("last_hard_state", Int)
            .dyn_("last_hard_state_change", Time)
            .dyn_("last_notification", Time)
            .dyn_("next_check", Time)
            .dyn_("current_attempt", Int)
            .dyn_("plugin_output", String)
            .dyn_("long_plugin_output", String)
            .dyn_("perf_data", String)
            .dyn_("acknowledged", Int)
            .dyn_("acknowledgement_type", Int)
            .dyn_("scheduled_downtime_depth", Int)
            .dyn_("checks_enabled", Int)
            .dyn_("notifications_enabled", Int)
            .dyn_("is_flapping", Int)
            .dyn_("is_executing", Int)
            .dyn_("latency", Float)
            .dyn_("execution_time", Float)
            .dyn_("percent_state_change", Float)
            .dyn_("modified_attributes", Int)
            .dyn_("comments", IntList)
            .dyn_("downtimes", IntList)
            .peer_columns()
            .build(),
        TableBuilder::new("services", &["host_name", "description"])
            .stat("host_name", String)
            .stat("description", String)
            .stat("display_name", String)
            .stat("check_command", String)
            .stat("check_period", String)
            .stat("notification_period", String)
            .stat("contacts", StringList)
            .stat("contact_groups", StringList)
            .stat("groups", StringList)
            .stat("notes", String)
            .stat("notes_url", String)
            .stat("action_url", String)
            .stat("icon_image", String)
            .stat("max_check_attempts", Int)
            .stat("check_interval", Float)
            .stat("retry_interval", Float)
            .stat("custom_variable_names", StringList)
            .stat("custom_variable_values", StringList)
            .dyn_("custom_variables", CustomVariables)
            .dyn_("state", Int)
            .dyn_("state_type", Int)
            .dyn_("has_been_checked", Int)
            .dyn_("last_check", Time)
            .dyn_("last_state_change", Time)
            .dyn_("last_hard_state", Int)
            .dyn_("last_hard_state_change", Time)
            .dyn_("last_notification", Time)
            .dyn_("next_check", Time)
            .dyn_("current_attempt", Int)
            .dyn_("plugin_output", String)
            .dyn_("long_plugin_output", String)
            .dyn_("perf_data", String)
            .dyn_("acknowledged", Int)
            .dyn_("acknowledgement_type", Int)
            .dyn_("scheduled_downtime_depth", Int)
            .dyn_("checks_enabled", Int)
            .dyn_("notifications_enabled", Int)
            .dyn_("is_flapping", Int)
            .dyn_("is_executing", Int)
            .dyn_("latency", Float)
            .dyn_("execution_time", Float)
            .dyn_("percent_state_change", Float)
            .dyn_("modified_attributes", Int)
            .dyn_("comments", IntList)
            .dyn_("downtimes", IntList)
            .join("host_alias", String, "hosts", "alias")
            .join("host_address", String, "hosts", "address")
            .join("host_groups", StringList, "hosts", "groups")
            .join("host_contacts", StringList, "hosts", "contacts")
            .join("host_state", Int, "hosts", "state")
            .join("host_has_been_checked", Int, "hosts", "has_been_checked")
            .join("host_last_state_change", Time, "hosts", "last_state_change")
            .join("host_plugin_output", String, "hosts", "plugin_output")
            .join("host_acknowledged", Int, "hosts", "acknowledged")
            .join(
                "host_scheduled_downtime_depth",
                Int,
                "hosts",
                "scheduled_downtime_depth",
            )
            .join("host_checks_enabled", Int, "hosts", "checks_enabled")
            .join(
                "host_notifications_enabled",
                Int,
                "hosts",
                "notifications_enabled",
            )
            .peer_columns()
            .build(),
        TableBuilder::new("hostgroups", &["name"])
            .stat("name", String)
            .stat("alias", String)
            .stat("notes", String)
            .stat("notes_url", String)
            .stat("action_url", String)
            .stat("members", StringList)
            .peer_columns()
            .build(),
        TableBuilder::new("servicegroups", &["name"])
            .stat("name", String)
            .stat("alias", String)
            .stat("notes", String)
            .stat("notes_url", String)
            .stat("action_url", String)
            .stat("members", StringList)
            .peer_columns()
            .build(),
        TableBuilder::new("contacts", &["name"])
            .stat("name", String)
            .stat("alias", String)
            .stat("email", String)
            .stat("pager", String)
            .stat("host_notification_period", String)
            .stat("service_notification_period", String)
            .dyn_("host_notifications_enabled", Int)
            .dyn_("service_notifications_enabled", Int)
            .peer_columns()
            .build(),
        TableBuilder::new("contactgroups", &["name"])
            .stat("name", String)
            .stat("alias", String)
            .stat("members", StringList)
            .peer_columns()
            .build(),
        TableBuilder::new("commands", &["name"])
            .stat("name", String)
            .stat("line", String)
            .peer_columns()
            .build(),
        TableBuilder::new("timeperiods", &["name"])
            .stat("name", String)
            .stat("alias", String)
            .dyn_("in", Int)
            .peer_columns()
            .build(),
        TableBuilder::new("comments", &["id"])
            .stat("id", Int)
            .stat("author", String)
            .stat("comment", String)
            .stat("entry_time", Time)
            .stat("entry_type", Int)
            .stat("expires", Int)
            .stat("expire_time", Time)
            .stat("persistent", Int)
            .stat("source", Int)
            .stat("type", Int)
            .stat("is_service", Int)
            .stat("host_name", String)
            .stat("service_description", String)
            .peer_columns()
            .build(),
        TableBuilder::new("downtimes", &["id"])
            .stat("id", Int)
            .stat("author", String)
            .stat("comment", String)
            .stat("entry_time", Time)
            .stat("start_time", Time)
            .stat("end_time", Time)
            .stat("duration", Int)
            .stat("fixed", Int)
            .stat("triggered_by", Int)
            .stat("type", Int)
            .stat("is_service", Int)
            .stat("host_name", String)
            .stat("service_description", String)
            .peer_columns()
            .build(),
        TableBuilder::new("status", &[])
            .dyn_("program_start", Time)
            .dyn_("last_command_check", Time)
            .dyn_("last_log_rotation", Time)
            .dyn_("enable_notifications", Int)
            .dyn_("execute_service_checks", Int)
            .dyn_("execute_host_checks", Int)
            .dyn_("accept_passive_host_checks", Int)
            .dyn_("accept_passive_service_checks", Int)
            .dyn_("enable_event_handlers", Int)
            .dyn_("enable_flap_detection", Int)
            .dyn_("process_performance_data", Int)
            .dyn_("connections", Int)
            .stat("nagios_pid", Int)
            .stat("interval_length", Int)
            .stat("program_version", String)
            .stat("livestatus_version", String)
            .peer_columns()
            .build(),
        TableBuilder::new("log", &[])
            .push("time", Time, UpdateType::None)
            .push("class", Int, UpdateType::None)
            .push("message", String, UpdateType::None)
            .push("type", String, UpdateType::None)
            .push("state", Int, UpdateType::None)
            .push("state_type", String, UpdateType::None)
            .push("attempt", Int, UpdateType::None)
            .push("host_name", String, UpdateType::None)
            .push("service_description", String, UpdateType::None)
            .push("contact_name", String, UpdateType::None)
            .push("command_name", String, UpdateType::None)
            .push("plugin_output", String, UpdateType::None)
            .passthrough()
            .build(),
        TableBuilder::new("backends", &["peer_key"])
            .local("peer_key", String)
            .local("peer_name", String)
            .local("section", String)
            .local("parent", String)
            .local("addr", String)
            .local("status", Int)
            .local("last_error", String)
            .local("last_update", Time)
            .local("last_full_update", Time)
            .local("last_online", Time)
            .local("response_time", Float)
            .local("program_start", Time)
            .local("core_version", String)
            .local("update_interval", Int)
            .local("bytes_send", Int)
            .local("bytes_received", Int)
            .local("queries", Int)
            .virtual_table()
            .build(),
        TableBuilder::new("columns", &["table", "name"])
            .local("table", String)
            .local("name", String)
            .local("type", String)
            .local("update", String)
            .virtual_table()
            .build(),
        TableBuilder::new("tables", &["name"])
            .local("name", String)
            .local("virtual", Int)
            .local("passthrough", Int)
            .local("keys", StringList)
            .virtual_table()
            .build(),
    ]
}
