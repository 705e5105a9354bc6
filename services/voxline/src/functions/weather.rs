use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use voxline_core::call_context::SharedCallContext;
use voxline_core::tools::{ToolDefinition, ToolOutput};

use super::{Function, ToolError, required_str};

const GEOCODING_URL: &str = "https://geocoding-api.open-meteo.com/v1/search";
const FORECAST_URL: &str = "https://api.open-meteo.com/v1/forecast";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Celsius,
    Fahrenheit,
}

impl Unit {
    fn parse(format: Option<&str>) -> Result<Self, ToolError> {
        match format.map(str::to_lowercase).as_deref() {
            None | Some("celsius") => Ok(Self::Celsius),
            Some("fahrenheit") => Ok(Self::Fahrenheit),
            Some(other) => Err(ToolError::InvalidArguments(format!(
                "unknown temperature format '{other}'"
            ))),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Celsius => "celsius",
            Self::Fahrenheit => "fahrenheit",
        }
    }
}

#[derive(Debug, Deserialize)]
struct GeocodingResponse {
    #[serde(default)]
    results: Vec<Place>,
}

#[derive(Debug, Deserialize)]
struct Place {
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    current: CurrentConditions,
}

#[derive(Debug, Deserialize)]
struct CurrentConditions {
    temperature_2m: f64,
}

/// Current temperature from Open-Meteo.
pub struct CurrentWeather {
    http: reqwest::Client,
    geocoding_url: String,
    forecast_url: String,
}

impl CurrentWeather {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            geocoding_url: GEOCODING_URL.to_string(),
            forecast_url: FORECAST_URL.to_string(),
        }
    }

    async fn locate(&self, location: &str) -> Result<Place, ToolError> {
        // "San Francisco, CA": the geocoder matches on the place name only.
        let name = location.split(',').next().unwrap_or(location).trim();
        let response: GeocodingResponse = self
            .http
            .get(&self.geocoding_url)
            .query(&[("name", name), ("count", "1"), ("format", "json")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        response
            .results
            .into_iter()
            .next()
            .ok_or_else(|| ToolError::Failed(format!("could not find a place called {location}")))
    }

    async fn temperature(&self, place: &Place, unit: Unit) -> Result<f64, ToolError> {
        let response: ForecastResponse = self
            .http
            .get(&self.forecast_url)
            .query(&[
                ("latitude", place.latitude.to_string()),
                ("longitude", place.longitude.to_string()),
                ("current", "temperature_2m".to_string()),
                ("temperature_unit", unit.as_str().to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.current.temperature_2m)
    }
}

#[async_trait]
impl Function for CurrentWeather {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "get_current_weather".into(),
            description: "Get the current weather".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "location": {
                        "type": "string",
                        "description": "The city and state, e.g. San Francisco, CA"
                    },
                    "format": {
                        "type": "string",
                        "enum": ["celsius", "fahrenheit"],
                        "description": "The temperature unit to use. Infer this from the users location."
                    }
                },
                "required": ["location", "format"]
            }),
            say: None,
        }
    }

    async fn call(&self, args: Value, _ctx: &SharedCallContext) -> Result<ToolOutput, ToolError> {
        let location = required_str(&args, "location")?;
        let unit = Unit::parse(args.get("format").and_then(Value::as_str))?;

        let place = self.locate(location).await?;
        let temperature = self.temperature(&place, unit).await?;

        let reply = json!({
            "temperature": temperature.to_string(),
            "unit": unit.as_str(),
        });
        Ok(ToolOutput::text(reply.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxline_core::call_context::CallContext;

    #[test]
    fn unit_defaults_to_celsius() {
        assert_eq!(Unit::parse(None).unwrap(), Unit::Celsius);
        assert_eq!(Unit::parse(Some("Fahrenheit")).unwrap(), Unit::Fahrenheit);
        assert!(Unit::parse(Some("kelvin")).is_err());
    }

    #[test]
    fn responses_deserialize() {
        let geo: GeocodingResponse = serde_json::from_str(
            r#"{"results":[{"id":1,"name":"Paris","latitude":48.85,"longitude":2.35}]}"#,
        )
        .unwrap();
        assert_eq!(geo.results[0].latitude, 48.85);

        let empty: GeocodingResponse = serde_json::from_str(r#"{"generationtime_ms":0.5}"#).unwrap();
        assert!(empty.results.is_empty());

        let forecast: ForecastResponse = serde_json::from_str(
            r#"{"latitude":48.86,"current":{"time":"2024-07-08T10:00","temperature_2m":21.4}}"#,
        )
        .unwrap();
        assert_eq!(forecast.current.temperature_2m, 21.4);
    }

    #[tokio::test]
    async fn location_is_required() {
        let weather = CurrentWeather::new(reqwest::Client::new());
        let ctx = CallContext::new("CA1", "", "").shared();
        let result = weather.call(json!({"format": "celsius"}), &ctx).await;
        assert!(matches!(result, Err(ToolError::InvalidArguments(_))));
    }
}
