use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::JappsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    Python,
    Streamlit,
    #[serde(alias = "plotlydash")]
    Dash,
    Voila,
    Bokeh,
    Panel,
    Gradio,
    #[serde(alias = "jupyter_lab")]
    JupyterLab,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilepathRequirement {
    Required,
    Optional,
    Unused,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameworkSpec {
    pub framework: Framework,
    pub display_name: &'static str,
    /// Empty for `custom`; the command body is user-supplied.
    pub template: &'static [&'static str],
    pub filepath: FilepathRequirement,
    pub env: &'static [(&'static str, &'static str)],
}

pub const ALL_FRAMEWORKS: [Framework; 9] = [
    Framework::Python,
    Framework::Streamlit,
    Framework::Dash,
    Framework::Voila,
    Framework::Bokeh,
    Framework::Panel,
    Framework::Gradio,
    Framework::JupyterLab,
    Framework::Custom,
];

const PYTHON_TEMPLATE: &[&str] = &["{python_executable}", "{filepath}", "--port={port}"];

const STREAMLIT_TEMPLATE: &[&str] = &[
    "{python_executable}",
    "-m",
    "streamlit",
    "run",
    "{filepath}",
    "--server.port={port}",
    "--server.headless=True",
    "--server.baseUrlPath={base_url}",
    "--browser.serverAddress={origin_host}",
    "--browser.gatherUsageStats=false",
];

const DASH_TEMPLATE: &[&str] = &["{python_executable}", "{filepath}", "--port={port}"];

const VOILA_TEMPLATE: &[&str] = &[
    "{python_executable}",
    "-m",
    "voila",
    "{filepath}",
    "--port={port}",
    "--no-browser",
    "--Voila.base_url={base_url}",
    "--Voila.ip=0.0.0.0",
];

const BOKEH_TEMPLATE: &[&str] = &[
    "{python_executable}",
    "-m",
    "bokeh",
    "serve",
    "{filepath}",
    "--port={port}",
    "--allow-websocket-origin={origin_host}",
    "--prefix={base_url}",
];

const PANEL_TEMPLATE: &[&str] = &[
    "{python_executable}",
    "-m",
    "panel",
    "serve",
    "{filepath}",
    "--port={port}",
    "--allow-websocket-origin={origin_host}",
    "--prefix={base_url}",
];

const GRADIO_TEMPLATE: &[&str] = &["{python_executable}", "{filepath}", "--port={port}"];

const JUPYTERLAB_TEMPLATE: &[&str] = &[
    "{python_executable}",
    "-m",
    "jupyterlab",
    "--port={port}",
    "--no-browser",
    "--ServerApp.base_url={base_url}",
];

impl Framework {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Streamlit => "streamlit",
            Self::Dash => "dash",
            Self::Voila => "voila",
            Self::Bokeh => "bokeh",
            Self::Panel => "panel",
            Self::Gradio => "gradio",
            Self::JupyterLab => "jupyterlab",
            Self::Custom => "custom",
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, Self::Custom)
    }

    pub fn spec(&self) -> FrameworkSpec {
        let (display_name, template, filepath, env): (
            &'static str,
            &'static [&'static str],
            FilepathRequirement,
            &'static [(&'static str, &'static str)],
        ) = match self {
            Self::Python => (
                "Python script",
                PYTHON_TEMPLATE,
                FilepathRequirement::Required,
                &[],
            ),
            Self::Streamlit => (
                "Streamlit",
                STREAMLIT_TEMPLATE,
                FilepathRequirement::Required,
                &[],
            ),
            Self::Dash => (
                "Plotly Dash",
                DASH_TEMPLATE,
                FilepathRequirement::Required,
                &[("DASH_REQUESTS_PATHNAME_PREFIX", "{base_url}")],
            ),
            Self::Voila => ("Voila", VOILA_TEMPLATE, FilepathRequirement::Optional, &[]),
            Self::Bokeh => ("Bokeh", BOKEH_TEMPLATE, FilepathRequirement::Required, &[]),
            Self::Panel => ("Panel", PANEL_TEMPLATE, FilepathRequirement::Required, &[]),
            Self::Gradio => (
                "Gradio",
                GRADIO_TEMPLATE,
                FilepathRequirement::Required,
                &[
                    ("GRADIO_SERVER_PORT", "{port}"),
                    ("GRADIO_ROOT_PATH", "{base_url}"),
                ],
            ),
            Self::JupyterLab => (
                "JupyterLab",
                JUPYTERLAB_TEMPLATE,
                FilepathRequirement::Unused,
                &[],
            ),
            Self::Custom => ("Custom command", &[], FilepathRequirement::Unused, &[]),
        };
        FrameworkSpec {
            framework: *self,
            display_name,
            template,
            filepath,
            env,
        }
    }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Framework {
    type Err = JappsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "python" => Ok(Self::Python),
            "streamlit" => Ok(Self::Streamlit),
            "dash" | "plotlydash" => Ok(Self::Dash),
            "voila" => Ok(Self::Voila),
            "bokeh" => Ok(Self::Bokeh),
            "panel" => Ok(Self::Panel),
            "gradio" => Ok(Self::Gradio),
            "jupyterlab" | "jupyter_lab" => Ok(Self::JupyterLab),
            "custom" | "generic" => Ok(Self::Custom),
            _ => Err(JappsError::configuration(
                "framework",
                format!("unsupported framework '{}'", value.trim()),
            )),
        }
    }
}

pub fn frameworks() -> Vec<FrameworkSpec> {
    ALL_FRAMEWORKS.iter().map(Framework::spec).collect()
}
