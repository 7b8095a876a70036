// Farm overview shown on the landing view. The figures are a fixed sample;
// no sensor or weather feed is wired in.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct CurrentConditions {
    pub temperature_c: f32,
    pub rainfall_mm: f32,
    pub humidity_pct: u8,
    pub wind_kmh: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForecastDay {
    pub day: &'static str,
    pub temperature_c: f32,
    pub rainfall_mm: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Critical,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize)]
pub struct FarmAlert {
    pub severity: AlertSeverity,
    pub title: &'static str,
    pub detail: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct FarmOverview {
    pub conditions: CurrentConditions,
    pub forecast: Vec<ForecastDay>,
    pub alerts: Vec<FarmAlert>,
    pub mean_temperature_c: f32,
    pub total_rainfall_mm: f32,
}

impl FarmOverview {
    pub fn sample() -> Self {
        let forecast = vec![
            day("Mon", 22.0, 12.0),
            day("Tue", 24.0, 5.0),
            day("Wed", 19.0, 25.0),
            day("Thu", 21.0, 8.0),
            day("Fri", 25.0, 0.0),
            day("Sat", 27.0, 0.0),
            day("Sun", 23.0, 2.0),
        ];
        let alerts = vec![
            FarmAlert {
                severity: AlertSeverity::Critical,
                title: "Pest Alert: Aphids",
                detail: "High risk in tomato sector due to recent humidity.",
            },
            FarmAlert {
                severity: AlertSeverity::Warning,
                title: "Irrigation Needed",
                detail: "Sector 4 soil moisture is below 30%.",
            },
            FarmAlert {
                severity: AlertSeverity::Info,
                title: "Harvest Ready",
                detail: "Basil ready for harvest in Greenhouse 2.",
            },
        ];
        Self::new(
            CurrentConditions {
                temperature_c: 24.0,
                rainfall_mm: 12.0,
                humidity_pct: 68,
                wind_kmh: 14.0,
            },
            forecast,
            alerts,
        )
    }

    pub fn new(conditions: CurrentConditions, forecast: Vec<ForecastDay>, alerts: Vec<FarmAlert>) -> Self {
        let total_rainfall_mm = forecast.iter().map(|d| d.rainfall_mm).sum();
        let mean_temperature_c = if forecast.is_empty() {
            conditions.temperature_c
        } else {
            forecast.iter().map(|d| d.temperature_c).sum::<f32>() / forecast.len() as f32
        };
        Self {
            conditions,
            forecast,
            alerts,
            mean_temperature_c,
            total_rainfall_mm,
        }
    }
}

fn day(day: &'static str, temperature_c: f32, rainfall_mm: f32) -> ForecastDay {
    ForecastDay {
        day,
        temperature_c,
        rainfall_mm,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_week_totals() {
        let overview = FarmOverview::sample();
        assert_eq!(overview.forecast.len(), 7);
        assert_eq!(overview.total_rainfall_mm, 52.0);
        assert!((overview.mean_temperature_c - 23.0).abs() < 0.01);
        assert_eq!(overview.alerts[0].severity, AlertSeverity::Critical);
    }

    #[test]
    fn test_empty_forecast_falls_back_to_current_temperature() {
        let conditions = FarmOverview::sample().conditions;
        let overview = FarmOverview::new(conditions, Vec::new(), Vec::new());
        assert_eq!(overview.mean_temperature_c, 24.0);
        assert_eq!(overview.total_rainfall_mm, 0.0);
    }
}
