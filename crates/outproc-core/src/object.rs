use crate::error::CommunicatorError;

pub const VERSION_ANY: u32 = u32::MAX;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Object {
    pub locator: String,
    pub class_name: String,
    pub interface_id: u32,
    pub version: u32,
    pub user: String,
    pub group: String,
}

impl Default for Object {
    fn default() -> Self {
        Self {
            locator: String::new(),
            class_name: String::new(),
            interface_id: u32::MAX,
            version: VERSION_ANY,
            user: String::new(),
            group: String::new(),
        }
    }
}

impl Object {
    pub fn new(locator: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            class_name: class_name.into(),
            ..Self::default()
        }
    }

    pub fn with_interface(mut self, interface_id: u32) -> Self {
        self.interface_id = interface_id;
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn has_version(&self) -> bool {
        self.version != VERSION_ANY
    }

    pub fn validate(&self) -> Result<(), CommunicatorError> {
        if self.locator.trim().is_empty() {
            return Err(CommunicatorError::InvalidObject(
                "object locator is required".to_string(),
            ));
        }
        if self.class_name.trim().is_empty() {
            return Err(CommunicatorError::InvalidObject(
                "object class name is required".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    pub connector: String,
    pub host_application: String,
    pub persistent_path: String,
    pub system_path: String,
    pub data_path: String,
    pub application_path: String,
    pub proxy_stub_path: String,
}

impl Config {
    pub fn new(connector: impl Into<String>, host_application: impl Into<String>) -> Self {
        Self {
            connector: connector.into(),
            host_application: host_application.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), CommunicatorError> {
        if self.connector.trim().is_empty() {
            return Err(CommunicatorError::InvalidConfig(
                "connector is required".to_string(),
            ));
        }
        if self.host_application.trim().is_empty() {
            return Err(CommunicatorError::InvalidConfig(
                "host application is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Single-letter options handed to the host application. Keys keep the
/// order in which they were set so the command line is deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LaunchOptions {
    entries: Vec<(char, String)>,
}

impl LaunchOptions {
    pub fn from_parts(object: &Object, config: &Config) -> Result<Self, CommunicatorError> {
        object.validate()?;
        config.validate()?;

        let mut options = Self::default();
        options.set('l', &object.locator);
        options.set('c', &object.class_name);
        options.set('r', &config.connector);
        options.set('i', object.interface_id.to_string());
        if object.has_version() {
            options.set('v', object.version.to_string());
        }
        options.set_non_empty('u', &object.user);
        options.set_non_empty('g', &object.group);
        options.set_non_empty('p', &config.persistent_path);
        options.set_non_empty('s', &config.system_path);
        options.set_non_empty('d', &config.data_path);
        options.set_non_empty('a', &config.application_path);
        options.set_non_empty('m', &config.proxy_stub_path);
        Ok(options)
    }

    pub fn set(&mut self, key: char, value: impl Into<String>) {
        let value = value.into();
        if let Some(existing) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            existing.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    fn set_non_empty(&mut self, key: char, value: &str) {
        if !value.is_empty() {
            self.set(key, value);
        }
    }

    pub fn get(&self, key: char) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_args(&self) -> Vec<String> {
        self.entries
            .iter()
            .flat_map(|(key, value)| [format!("-{key}"), value.clone()])
            .collect()
    }
}
