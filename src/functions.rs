use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::LLMError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: FunctionParameters,
}

impl FunctionDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters: FunctionParameters::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parameter(mut self, parameter: FunctionParameter) -> Self {
        self.add_parameter(parameter);
        self
    }

    pub fn add_parameter(&mut self, parameter: FunctionParameter) {
        let FunctionParameter {
            name,
            mut schema,
            description,
            required,
        } = parameter;

        if let (Some(description), Some(object)) = (description, schema.as_object_mut()) {
            object.insert("description".to_string(), Value::String(description));
        }

        if required {
            self.parameters.required.push(name.clone());
        }

        self.parameters.properties.insert(name, schema);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionParameters {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(rename = "additionalProperties", skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<bool>,
}

impl FunctionParameters {
    pub fn new() -> Self {
        Self {
            kind: "object".to_string(),
            properties: BTreeMap::new(),
            required: Vec::new(),
            additional_properties: Some(false),
        }
    }
}

impl Default for FunctionParameters {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct FunctionParameter {
    pub name: String,
    pub schema: Value,
    pub description: Option<String>,
    pub required: bool,
}

impl FunctionParameter {
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
            description: None,
            required: true,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub kind: ToolType,
    pub function: FunctionDefinition,
}

impl From<FunctionDefinition> for Tool {
    fn from(function: FunctionDefinition) -> Self {
        Self {
            kind: ToolType::Function,
            function,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolType {
    Function,
}

#[derive(Debug, Clone)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: Value,
    pub raw_arguments: Option<String>,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
            raw_arguments: None,
        }
    }
}

/// A tool call requested by the model. Serialized in the OpenAI wire shape,
/// where `function.arguments` is a JSON document encoded as a string.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: Option<String>,
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn new(function: FunctionCall) -> Self {
        Self { id: None, function }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

impl Serialize for ToolCall {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("ToolCall", 3)?;
        if let Some(id) = &self.id {
            state.serialize_field("id", id)?;
        }
        state.serialize_field("type", "function")?;
        state.serialize_field("function", &WireFunctionCall(&self.function))?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for ToolCall {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct RawFunctionCall {
            name: String,
            #[serde(default)]
            arguments: String,
        }

        #[derive(Deserialize)]
        struct RawToolCall {
            id: Option<String>,
            #[serde(rename = "type", default = "function_kind")]
            kind: String,
            function: RawFunctionCall,
        }

        fn function_kind() -> String {
            "function".to_string()
        }

        let raw = RawToolCall::deserialize(deserializer)?;
        if raw.kind != "function" {
            return Err(serde::de::Error::custom(format!(
                "unsupported tool call type '{}'",
                raw.kind
            )));
        }

        let arguments = if raw.function.arguments.trim().is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(&raw.function.arguments).map_err(|error| {
                serde::de::Error::custom(format!("failed to parse function arguments: {error}"))
            })?
        };

        Ok(Self {
            id: raw.id,
            function: FunctionCall {
                name: raw.function.name,
                arguments,
                raw_arguments: Some(raw.function.arguments),
            },
        })
    }
}

struct WireFunctionCall<'a>(&'a FunctionCall);

impl Serialize for WireFunctionCall<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("function", 2)?;
        state.serialize_field("name", &self.0.name)?;
        let raw = match &self.0.raw_arguments {
            Some(raw) => raw.clone(),
            None => serde_json::to_string(&self.0.arguments)
                .map_err(|error| serde::ser::Error::custom(error.to_string()))?,
        };
        state.serialize_field("arguments", &raw)?;
        state.end()
    }
}

#[async_trait]
pub trait KernelFunction: Send + Sync {
    fn definition(&self) -> FunctionDefinition;

    async fn invoke(&self, arguments: &Value) -> Result<Value, LLMError>;
}

pub type DynKernelFunction = Arc<dyn KernelFunction>;

#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, DynKernelFunction>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, function: DynKernelFunction) {
        let name = function.definition().name;
        self.functions.insert(name, function);
    }

    pub fn get(&self, name: &str) -> Option<&DynKernelFunction> {
        self.functions.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn definitions(&self) -> Vec<FunctionDefinition> {
        self.functions
            .values()
            .map(|function| function.definition())
            .collect()
    }

    pub fn tools(&self) -> Vec<Tool> {
        self.definitions().into_iter().map(Tool::from).collect()
    }

    pub async fn invoke(&self, call: &FunctionCall) -> Result<Value, LLMError> {
        let function = self
            .get(&call.name)
            .ok_or_else(|| LLMError::UnknownFunction(call.name.clone()))?;
        function.invoke(&call.arguments).await
    }
}

pub fn json_schema_for<T: JsonSchema>() -> Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema.schema).unwrap_or_default()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    None,
    Auto,
    Required,
}
