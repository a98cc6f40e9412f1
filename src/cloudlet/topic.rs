//! `METHOD/resource/...` request topics

use crate::error::{CloudError, CloudResult};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestMethod {
    Get,
    Put,
    Post,
    Del,
    Exec,
}

impl RequestMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestMethod::Get => "GET",
            RequestMethod::Put => "PUT",
            RequestMethod::Post => "POST",
            RequestMethod::Del => "DEL",
            RequestMethod::Exec => "EXEC",
        }
    }
}

impl fmt::Display for RequestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestMethod {
    type Err = CloudError;

    /// Method names are case sensitive
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(RequestMethod::Get),
            "PUT" => Ok(RequestMethod::Put),
            "POST" => Ok(RequestMethod::Post),
            "DEL" => Ok(RequestMethod::Del),
            "EXEC" => Ok(RequestMethod::Exec),
            other => Err(CloudError::bad_request(format!(
                "unknown request method '{other}'"
            ))),
        }
    }
}

/// A parsed request topic: the method plus the resource path below it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudletTopic {
    pub method: RequestMethod,
    pub resources: Vec<String>,
}

impl CloudletTopic {
    /// Parse an application topic such as `GET/configurations/42`
    pub fn parse(app_topic: &str) -> CloudResult<Self> {
        let mut segments = app_topic.split('/');
        let method = segments
            .next()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| CloudError::bad_request("empty request topic"))?
            .parse()?;

        Ok(Self {
            method,
            resources: segments.map(str::to_string).collect(),
        })
    }

    /// The resource path without the method
    pub fn resource_path(&self) -> String {
        self.resources.join("/")
    }

    pub fn resource(&self, index: usize) -> Option<&str> {
        self.resources.get(index).map(String::as_str)
    }
}

impl fmt::Display for CloudletTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.method)?;
        for resource in &self.resources {
            write!(f, "/{resource}")?;
        }
        Ok(())
    }
}
