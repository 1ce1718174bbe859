pub mod alarm_engine;
pub mod analysis;
pub mod analytics_feeds;
pub mod battery_model;
pub mod deployments;
pub mod derived_sensors;
pub mod emporia;
pub mod emporia_ingest;
pub mod emporia_preferences;
pub mod external_devices;
pub mod forecasts;
pub mod incidents;
pub mod map_offline;
pub mod mdns_iotnode;
pub mod mqtt;
pub mod mqtt_status_ingest;
pub mod node_agent_resolver;
pub mod power_runway;
pub mod renogy_settings_apply;
pub mod restore_worker;
pub mod schedule_engine;
pub mod sensor_visibility;
pub mod virtual_sensors;
