use std::fmt;

use crate::types::Parameters;

/// Identifies a shared source graph: the service, the parameters it was
/// started with and the optimizations active for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamingKey {
    pub service: String,
    pub parameters: Parameters,
    pub optimizations: Vec<String>,
}

impl StreamingKey {
    pub fn new(service: impl Into<String>, parameters: &Parameters, optimizations: Vec<String>) -> Self {
        StreamingKey {
            service: service.into(),
            parameters: parameters.clone(),
            optimizations,
        }
    }
}

impl fmt::Display for StreamingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.service)?;
        if !self.parameters.is_empty() {
            let params: Vec<_> = self
                .parameters
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            write!(f, "({})", params.join(", "))?;
        }
        if !self.optimizations.is_empty() {
            write!(f, "[{}]", self.optimizations.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        let mut params = Parameters::new();
        params.insert("region".to_string(), "EU".to_string());
        let key = StreamingKey::new("sales", &params, vec!["cache".to_string()]);
        assert_eq!("sales(region=EU)[cache]", key.to_string());
        assert_eq!("sales", StreamingKey::new("sales", &Parameters::new(), Vec::new()).to_string());
    }

    #[test]
    fn parameters_distinguish_keys() {
        let mut params = Parameters::new();
        params.insert("region".to_string(), "EU".to_string());
        assert_ne!(
            StreamingKey::new("sales", &params, Vec::new()),
            StreamingKey::new("sales", &Parameters::new(), Vec::new())
        );
    }
}
