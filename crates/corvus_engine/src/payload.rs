use crate::analyzer;

use corvus_core::prelude::*;

const DEFAULT_SCRIPT_NAME: &str = "script.py";

#[derive(Debug, Clone)]
pub struct ResolvedPayload {
    pub payload: JobPayload,
    /// Set when the profile was chosen automatically.
    pub note: Option<String>,
}

/// Turns a [`JobRequest`] into a validated [`JobPayload`].
#[derive(Debug, Clone)]
pub struct PayloadResolver {
    profiles: ProfileRegistry,
    gpu_available: bool,
}

impl PayloadResolver {
    pub fn new(profiles: ProfileRegistry, gpu_available: bool) -> Self {
        Self {
            profiles,
            gpu_available,
        }
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.profiles
    }

    pub fn resolve(&self, request: &JobRequest) -> Result<ResolvedPayload, EngineError> {
        let mut note = None;
        let name = match request.profile.as_deref() {
            Some(name) if name != AUTO_PROFILE => name,
            _ => {
                let gpu_allowed = self.gpu_available && request.mode != Some(ExecutionMode::Cpu);
                let analysis = analyzer::analyze(&request.script, gpu_allowed);
                note = Some(analysis.reasoning);
                analysis.profile
            }
        };

        let base = self.profiles.resolve(name)?;
        let mode = request.mode.unwrap_or(if base.requires_gpu {
            ExecutionMode::Gpu
        } else {
            ExecutionMode::Cpu
        });

        if mode == ExecutionMode::Cpu && base.requires_gpu {
            return Err(EngineError::InvalidPayload(format!(
                "Profile '{name}' requires gpu execution"
            )));
        }
        if mode == ExecutionMode::Gpu && !self.gpu_available {
            return Err(EngineError::InvalidPayload(
                "GPU execution is not available".to_string(),
            ));
        }

        let profile = match &request.overrides {
            Some(overrides) => overrides.apply(base),
            None => base.clone(),
        };

        Ok(ResolvedPayload {
            payload: JobPayload {
                script: request.script.clone(),
                script_name: request
                    .script_name
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SCRIPT_NAME.to_string()),
                mode,
                profile,
            },
            note,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn resolver(gpu: bool) -> PayloadResolver {
        PayloadResolver::new(ProfileRegistry::default(), gpu)
    }

    fn request(profile: Option<&str>, mode: Option<ExecutionMode>) -> JobRequest {
        JobRequest {
            script: "print(1)".to_string(),
            profile: profile.map(str::to_string),
            mode,
            ..Default::default()
        }
    }

    #[test]
    fn explicit_profile_and_mode() {
        let resolved = resolver(true)
            .resolve(&request(Some("medium"), Some(ExecutionMode::Cpu)))
            .unwrap();
        assert_eq!(resolved.payload.profile.name, "medium");
        assert_eq!(resolved.payload.mode, ExecutionMode::Cpu);
        assert_eq!(resolved.payload.script_name, "script.py");
        assert!(resolved.note.is_none());
    }

    #[test]
    fn gpu_profile_implies_gpu_mode() {
        let resolved = resolver(true).resolve(&request(Some("gpu"), None)).unwrap();
        assert_eq!(resolved.payload.mode, ExecutionMode::Gpu);
    }

    #[test]
    fn inconsistent_combinations_are_rejected() {
        let err = resolver(true)
            .resolve(&request(Some("gpu"), Some(ExecutionMode::Cpu)))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidPayload(_)));

        let err = resolver(false)
            .resolve(&request(Some("small"), Some(ExecutionMode::Gpu)))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidPayload(_)));
    }

    #[test]
    fn auto_profile_records_reasoning() {
        let resolved = resolver(true).resolve(&request(Some("auto"), None)).unwrap();
        assert_eq!(resolved.payload.profile.name, "small");
        assert!(resolved.note.is_some());
    }

    #[test]
    fn auto_profile_respects_explicit_cpu_mode() {
        let mut req = request(None, Some(ExecutionMode::Cpu));
        req.script = "import torch\nx.cuda()\n".to_string();
        let resolved = resolver(true).resolve(&req).unwrap();
        assert_eq!(resolved.payload.profile.name, "large");
        assert_eq!(resolved.payload.mode, ExecutionMode::Cpu);
    }

    #[test]
    fn overrides_derive_a_new_profile() {
        let mut req = request(Some("small"), None);
        req.overrides = Some(ResourceOverrides {
            timeout_secs: Some(5),
            ..Default::default()
        });
        let resolved = resolver(true).resolve(&req).unwrap();
        assert_eq!(resolved.payload.profile.wall_timeout, Duration::from_secs(10));
    }
}
