use super::instance::ModelInstance;
use crate::errors::ModelgenResult;
use crate::manifest::ModelDefinition;
use crate::schema::GroupKind;

/// The numerically integrated variables of one group, flattened into a
/// single vector in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumericLayout {
    keys: Vec<String>,
}

impl NumericLayout {
    pub fn new(definition: &ModelDefinition, kind: GroupKind) -> Self {
        let keys = definition
            .group(kind)
            .map(|g| {
                g.numeric_variables()
                    .map(|v| format!("{}.{}", kind.attr_name(), v.name))
                    .collect()
            })
            .unwrap_or_default();
        Self { keys }
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn gather(&self, instance: &ModelInstance) -> ModelgenResult<Vec<f64>> {
        let mut values = Vec::new();
        for key in &self.keys {
            values.extend(instance.flat(key)?);
        }
        Ok(values)
    }

    /// Write `values` back; each variable takes as many values as it holds.
    pub fn scatter(&self, instance: &mut ModelInstance, values: &[f64]) -> ModelgenResult<()> {
        let mut offset = 0;
        for key in &self.keys {
            let length = instance.get(key)?.len();
            let end = (offset + length).min(values.len());
            instance.set_flat(key, &values[offset.min(end)..end])?;
            offset += length;
        }
        Ok(())
    }
}
