//! The variable registry.
//!
//! One descriptor record per variable, covering both upstream sources.
//! The registry is built and validated once at startup; lookups by
//! identifier are total over the validated set and unknown identifiers
//! are a configuration error, not a panic.

use chunk_store::Compression;

use crate::domain::Domain;
use crate::error::{IngestError, Result};

/// Single-step gap-filling policy used when the output time axis is
/// finer than the natively published steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    /// Mean of the bracketing native slots.
    Linear,
    /// Previous native slot (wind direction and other non-averageable
    /// quantities).
    Nearest,
    /// Linear, clamped to >= 0; radiation cannot go negative.
    SolarRadiation,
}

/// Static metadata for one variable.
#[derive(Debug, Clone)]
pub struct Variable {
    pub id: &'static str,
    /// Query name on the reanalysis API.
    pub cds_name: &'static str,
    /// Unit conversion applied once after decoding a reanalysis grid,
    /// as `value * scale + offset`. Direct feeds may override per domain
    /// via [`Variable::unit_conversion`].
    pub unit_offset: f32,
    pub unit_scale: f32,
    /// Quantization scale of the compressed store.
    pub scale_factor: f32,
    /// Cumulative since model start on the forecast feeds.
    pub accumulated: bool,
    pub interpolation: Interpolation,
    /// Eligible for terrain-following height correction downstream.
    pub elevation_correctable: bool,
    /// Not defined at lead hour 0 by model convention.
    pub skip_hour0: bool,
}

impl Variable {
    /// GRIB field name on a direct feed, `None` when the domain does not
    /// serve this variable.
    pub fn grib_name(&self, domain: Domain) -> Option<&'static str> {
        use Domain::*;
        match (self.id, domain) {
            (_, Cerra) => None,

            ("temperature_2m", GemGlobal | GemRegional) => Some("TMP_TGL_2"),
            ("temperature_2m", GemHrdps) => Some("TMP_AGL-2m"),
            ("temperature_2m", GemEnsemble) => Some("TMP_TGL_2m"),

            ("relative_humidity_2m", GemGlobal | GemRegional) => Some("RH_TGL_2"),
            ("relative_humidity_2m", GemHrdps) => Some("RH_AGL-2m"),
            ("relative_humidity_2m", GemEnsemble) => Some("RH_TGL_2m"),

            ("wind_speed_10m", GemGlobal | GemRegional) => Some("WIND_TGL_10"),
            ("wind_speed_10m", GemHrdps) => Some("WIND_AGL-10m"),

            ("wind_direction_10m", GemGlobal | GemRegional) => Some("WDIR_TGL_10"),
            ("wind_direction_10m", GemHrdps) => Some("WDIR_AGL-10m"),

            ("wind_gusts_10m", GemGlobal | GemRegional) => Some("GUST_TGL_10"),
            ("wind_gusts_10m", GemHrdps) => Some("GUST_AGL-10m"),

            ("cloud_cover", GemGlobal | GemRegional) => Some("TCDC_SFC_0"),
            ("cloud_cover", GemHrdps) => Some("TCDC_Sfc"),
            ("cloud_cover", GemEnsemble) => Some("TCDC_SFC_0"),

            ("pressure_msl", GemGlobal | GemRegional) => Some("PRMSL_MSL_0"),
            ("pressure_msl", GemHrdps) => Some("PRMSL_MSL-0m"),
            ("pressure_msl", GemEnsemble) => Some("PRMSL_MSL_0"),

            ("snowfall_water_equivalent", GemGlobal | GemRegional) => Some("WEASN_SFC_0"),
            ("snowfall_water_equivalent", GemHrdps) => Some("WEASN_Sfc"),

            ("precipitation", GemGlobal | GemRegional) => Some("APCP_SFC_0"),
            ("precipitation", GemHrdps) => Some("APCP_Sfc"),
            ("precipitation", GemEnsemble) => Some("APCP_SFC_0"),

            ("shortwave_radiation", GemGlobal | GemRegional) => Some("DSWRF_SFC_0"),
            ("shortwave_radiation", GemHrdps) => Some("DSWRF_Sfc"),
            ("shortwave_radiation", GemEnsemble) => Some("DSWRF_SFC_0"),

            _ => None,
        }
    }

    /// Unit conversion for a freshly decoded grid of this variable from
    /// the given domain.
    pub fn unit_conversion(&self, domain: Domain) -> (f32, f32) {
        if domain == Domain::Cerra {
            return (self.unit_offset, self.unit_scale);
        }
        match self.id {
            // the feed serves Kelvin
            "temperature_2m" => (-273.15, 1.0),
            // accumulated J/m2 since model start; per-step deltas of the
            // scaled series are mean W/m2 over the step
            "shortwave_radiation" => (0.0, 1.0 / domain.dt_seconds() as f32),
            // already percent / mm / m s-1 / Pa on the direct feed
            _ => (0.0, 1.0),
        }
    }

    /// Whether the domain publishes this variable at the given lead hour.
    /// Hour-0 exclusions are handled separately via `skip_hour0`.
    pub fn included_for(&self, hour: u32, domain: Domain) -> bool {
        match (self.id, domain) {
            // the ensemble drops radiation fields on the 6-hourly tail
            ("shortwave_radiation", Domain::GemEnsemble) => hour <= 192,
            _ => true,
        }
    }

    /// Store codec: accumulated series grow without bound and keep full
    /// float precision, everything else is quantized.
    pub fn compression(&self) -> Compression {
        if self.accumulated {
            Compression::Float32
        } else {
            Compression::ScaledInt16
        }
    }
}

/// All known variables, validated once at startup.
#[derive(Debug)]
pub struct VariableRegistry {
    variables: Vec<Variable>,
}

impl VariableRegistry {
    pub fn load() -> Result<Self> {
        let registry = Self {
            variables: definitions(),
        };
        registry.validate()?;
        Ok(registry)
    }

    pub fn all(&self) -> &[Variable] {
        &self.variables
    }

    /// Variables a domain serves at all.
    pub fn for_domain(&self, domain: Domain) -> Vec<&Variable> {
        if domain == Domain::Cerra {
            self.variables.iter().filter(|v| !v.cds_name.is_empty()).collect()
        } else {
            self.variables
                .iter()
                .filter(|v| v.grib_name(domain).is_some())
                .collect()
        }
    }

    pub fn get(&self, id: &str) -> Result<&Variable> {
        self.variables
            .iter()
            .find(|v| v.id == id)
            .ok_or_else(|| IngestError::UnknownVariable(id.to_string()))
    }

    /// Resolve a comma-separated `--only-variables` list.
    pub fn parse_list(&self, list: &str) -> Result<Vec<&Variable>> {
        list.split(',')
            .map(|id| self.get(id.trim()))
            .collect()
    }

    fn validate(&self) -> Result<()> {
        if self.variables.is_empty() {
            return Err(IngestError::InvalidRegistry("no variables defined".into()));
        }
        for (i, v) in self.variables.iter().enumerate() {
            if v.id.is_empty() {
                return Err(IngestError::InvalidRegistry(format!("entry {i} has an empty id")));
            }
            if self.variables[..i].iter().any(|other| other.id == v.id) {
                return Err(IngestError::InvalidRegistry(format!("duplicate id '{}'", v.id)));
            }
            if !(v.scale_factor > 0.0) {
                return Err(IngestError::InvalidRegistry(format!(
                    "'{}' has non-positive scale factor {}",
                    v.id, v.scale_factor
                )));
            }
            if v.unit_scale == 0.0 {
                return Err(IngestError::InvalidRegistry(format!(
                    "'{}' has zero unit scale",
                    v.id
                )));
            }
            let served = !v.cds_name.is_empty()
                || Domain::ALL.iter().any(|&d| v.grib_name(d).is_some());
            if !served {
                return Err(IngestError::InvalidRegistry(format!(
                    "'{}' is not served by any source",
                    v.id
                )));
            }
        }
        Ok(())
    }
}

fn definitions() -> Vec<Variable> {
    use Interpolation::*;
    vec![
        Variable {
            id: "temperature_2m",
            cds_name: "2m_temperature",
            unit_offset: -273.15, // Kelvin to Celsius
            unit_scale: 1.0,
            scale_factor: 20.0,
            accumulated: false,
            interpolation: Linear,
            elevation_correctable: true,
            skip_hour0: false,
        },
        Variable {
            id: "relative_humidity_2m",
            cds_name: "2m_relative_humidity",
            unit_offset: 0.0,
            unit_scale: 1.0,
            scale_factor: 1.0,
            accumulated: false,
            interpolation: Linear,
            elevation_correctable: false,
            skip_hour0: false,
        },
        Variable {
            id: "wind_speed_10m",
            cds_name: "10m_wind_speed",
            unit_offset: 0.0,
            unit_scale: 1.0,
            scale_factor: 10.0,
            accumulated: false,
            interpolation: Linear,
            elevation_correctable: false,
            skip_hour0: false,
        },
        Variable {
            id: "wind_direction_10m",
            cds_name: "10m_wind_direction",
            unit_offset: 0.0,
            unit_scale: 1.0,
            scale_factor: 0.5,
            accumulated: false,
            interpolation: Nearest,
            elevation_correctable: false,
            skip_hour0: false,
        },
        Variable {
            id: "wind_gusts_10m",
            cds_name: "10m_wind_gust_since_previous_post_processing",
            unit_offset: 0.0,
            unit_scale: 1.0,
            scale_factor: 10.0,
            accumulated: false,
            interpolation: Linear,
            elevation_correctable: false,
            skip_hour0: true,
        },
        Variable {
            id: "cloud_cover",
            cds_name: "total_cloud_cover",
            unit_offset: 0.0,
            unit_scale: 100.0, // fraction to percent
            scale_factor: 1.0,
            accumulated: false,
            interpolation: Linear,
            elevation_correctable: false,
            skip_hour0: false,
        },
        Variable {
            id: "cloud_cover_low",
            cds_name: "low_cloud_cover",
            unit_offset: 0.0,
            unit_scale: 100.0,
            scale_factor: 1.0,
            accumulated: false,
            interpolation: Linear,
            elevation_correctable: false,
            skip_hour0: false,
        },
        Variable {
            id: "cloud_cover_mid",
            cds_name: "medium_cloud_cover",
            unit_offset: 0.0,
            unit_scale: 100.0,
            scale_factor: 1.0,
            accumulated: false,
            interpolation: Linear,
            elevation_correctable: false,
            skip_hour0: false,
        },
        Variable {
            id: "cloud_cover_high",
            cds_name: "high_cloud_cover",
            unit_offset: 0.0,
            unit_scale: 100.0,
            scale_factor: 1.0,
            accumulated: false,
            interpolation: Linear,
            elevation_correctable: false,
            skip_hour0: false,
        },
        Variable {
            id: "pressure_msl",
            cds_name: "mean_sea_level_pressure",
            unit_offset: 0.0,
            unit_scale: 1.0, // keep Pa
            scale_factor: 0.1,
            accumulated: false,
            interpolation: Linear,
            elevation_correctable: false,
            skip_hour0: false,
        },
        Variable {
            id: "snowfall_water_equivalent",
            cds_name: "snow_fall_water_equivalent",
            unit_offset: 0.0,
            unit_scale: 1000.0, // meter to millimeter
            scale_factor: 10.0,
            accumulated: true,
            interpolation: Linear,
            elevation_correctable: false,
            skip_hour0: true,
        },
        Variable {
            id: "precipitation",
            cds_name: "total_precipitation",
            unit_offset: 0.0,
            unit_scale: 1000.0, // meter to millimeter
            scale_factor: 10.0,
            accumulated: true,
            interpolation: Linear,
            elevation_correctable: false,
            skip_hour0: true,
        },
        Variable {
            id: "shortwave_radiation",
            cds_name: "surface_solar_radiation_downwards",
            unit_offset: 0.0,
            unit_scale: 1.0 / 3600.0, // joules to watt over the hourly step
            scale_factor: 1.0,
            accumulated: true,
            interpolation: SolarRadiation,
            elevation_correctable: false,
            skip_hour0: true,
        },
        Variable {
            id: "direct_radiation",
            cds_name: "time_integrated_surface_direct_short_wave_radiation_flux",
            unit_offset: 0.0,
            unit_scale: 1.0 / 3600.0,
            scale_factor: 1.0,
            accumulated: false,
            interpolation: SolarRadiation,
            elevation_correctable: false,
            skip_hour0: false,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_validates() {
        let registry = VariableRegistry::load().unwrap();
        assert!(registry.all().len() >= 12);
    }

    #[test]
    fn every_known_id_resolves() {
        let registry = VariableRegistry::load().unwrap();
        for v in registry.all() {
            assert_eq!(registry.get(v.id).unwrap().id, v.id);
        }
    }

    #[test]
    fn unknown_id_is_a_configuration_error() {
        let registry = VariableRegistry::load().unwrap();
        assert!(matches!(
            registry.get("sea_surface_vibes"),
            Err(IngestError::UnknownVariable(_))
        ));
    }

    #[test]
    fn parse_list_resolves_all_or_fails() {
        let registry = VariableRegistry::load().unwrap();
        let vars = registry.parse_list("temperature_2m, precipitation").unwrap();
        assert_eq!(vars.len(), 2);
        assert!(registry.parse_list("temperature_2m,nope").is_err());
    }

    #[test]
    fn accumulated_variables_keep_float_precision() {
        let registry = VariableRegistry::load().unwrap();
        assert_eq!(
            registry.get("precipitation").unwrap().compression(),
            Compression::Float32
        );
        assert_eq!(
            registry.get("temperature_2m").unwrap().compression(),
            Compression::ScaledInt16
        );
    }

    #[test]
    fn hrdps_serves_renamed_fields() {
        let registry = VariableRegistry::load().unwrap();
        let t2m = registry.get("temperature_2m").unwrap();
        assert_eq!(t2m.grib_name(Domain::GemHrdps), Some("TMP_AGL-2m"));
        assert_eq!(t2m.grib_name(Domain::GemGlobal), Some("TMP_TGL_2"));
        assert_eq!(t2m.grib_name(Domain::Cerra), None);
    }

    #[test]
    fn ensemble_skips_low_cloud_layers() {
        let registry = VariableRegistry::load().unwrap();
        let low = registry.get("cloud_cover_low").unwrap();
        assert_eq!(low.grib_name(Domain::GemEnsemble), None);
        let members: Vec<_> = registry.for_domain(Domain::GemEnsemble);
        assert!(members.iter().all(|v| v.id != "cloud_cover_low"));
    }

    #[test]
    fn direct_feed_unit_conversion_overrides() {
        let registry = VariableRegistry::load().unwrap();
        let t2m = registry.get("temperature_2m").unwrap();
        assert_eq!(t2m.unit_conversion(Domain::GemGlobal), (-273.15, 1.0));

        let cloud = registry.get("cloud_cover").unwrap();
        // CDS serves a fraction, the direct feed serves percent
        assert_eq!(cloud.unit_conversion(Domain::Cerra), (0.0, 100.0));
        assert_eq!(cloud.unit_conversion(Domain::GemHrdps), (0.0, 1.0));

        let swr = registry.get("shortwave_radiation").unwrap();
        let (_, scale) = swr.unit_conversion(Domain::GemEnsemble);
        assert_eq!(scale, 1.0 / 10_800.0);
    }
}
