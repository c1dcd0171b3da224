use crate::codegen::ast::{GroupRef, VarPath};
use crate::errors::{ModelgenError, ModelgenResult};
use crate::manifest::ModelDefinition;
use crate::schema::{ElementType, GroupKind};
use ndarray::{ArrayD, IxDyn};
use std::collections::BTreeMap;

/// Storage of one variable.
///
/// Values are held as `f64` whatever the element type; writes are cast the
/// way a C assignment to the declared element type would cast them.
#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    pub path: VarPath,
    pub element: ElementType,
    pub values: ArrayD<f64>,
}

impl Slot {
    fn new(path: VarPath, element: ElementType, ndim: usize) -> Self {
        Self {
            path,
            element,
            values: ArrayD::zeros(IxDyn(&vec![0; ndim])),
        }
    }

    pub fn ndim(&self) -> usize {
        self.values.ndim()
    }
}

/// Cast `value` to what a variable of type `element` can hold.
pub fn cast(element: ElementType, value: f64) -> f64 {
    match element {
        ElementType::Float => value,
        ElementType::Int => (value as i64) as f64,
        ElementType::Bool => {
            if value != 0.0 {
                1.0
            } else {
                0.0
            }
        }
    }
}

/// Values of every parameter and sequence of a model and its sub-models.
///
/// Slots are keyed by [`VarPath::slot_key`], e.g. `states.y`,
/// `old_states.y` or `loss.control.c`. Arrays start out empty; their shape is
/// set with [`ModelInstance::set_shape`] or [`ModelInstance::set_array`].
/// Link sequences hold their values directly.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInstance {
    slots: BTreeMap<String, Slot>,
}

impl ModelInstance {
    pub fn new(definition: &ModelDefinition) -> Self {
        let mut instance = Self {
            slots: BTreeMap::new(),
        };
        instance.add(&[], definition);
        instance
    }

    fn add(&mut self, owner: &[String], definition: &ModelDefinition) {
        for group in definition.groups() {
            for variable in &group.variables {
                let mut refs = vec![GroupRef::Kind(group.kind)];
                if group.kind == GroupKind::States {
                    refs.push(GroupRef::OldStates);
                }
                for group_ref in refs {
                    let path = VarPath::new(group_ref, &variable.name).prefixed(owner);
                    self.slots.insert(
                        path.slot_key(),
                        Slot::new(path, variable.element, variable.ndim),
                    );
                }
            }
        }
        for sub in &definition.submodels {
            let mut nested = owner.to_vec();
            nested.push(sub.name.clone());
            self.add(&nested, &sub.definition);
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    pub fn slot(&self, key: &str) -> ModelgenResult<&Slot> {
        self.slots
            .get(key)
            .ok_or_else(|| ModelgenError::UnknownVariable(key.to_string()))
    }

    fn slot_mut(&mut self, key: &str) -> ModelgenResult<&mut Slot> {
        self.slots
            .get_mut(key)
            .ok_or_else(|| ModelgenError::UnknownVariable(key.to_string()))
    }

    pub fn get(&self, key: &str) -> ModelgenResult<&ArrayD<f64>> {
        Ok(&self.slot(key)?.values)
    }

    /// Value of a scalar variable.
    pub fn scalar(&self, key: &str) -> ModelgenResult<f64> {
        let slot = self.slot(key)?;
        if slot.ndim() != 0 {
            return Err(ModelgenError::ShapeMismatch {
                variable: key.to_string(),
                expected: slot.ndim(),
                got: Vec::new(),
            });
        }
        Ok(slot.values.iter().next().copied().unwrap_or_default())
    }

    pub fn set_scalar(&mut self, key: &str, value: f64) -> ModelgenResult<()> {
        self.set_array(key, ArrayD::from_elem(IxDyn(&[]), value))
    }

    /// Replace the values of a variable. The dimensionality must match the
    /// declaration; setting a state with a new shape also resizes its
    /// previous-step values.
    pub fn set_array(&mut self, key: &str, values: ArrayD<f64>) -> ModelgenResult<()> {
        let slot = self.slot_mut(key)?;
        if slot.ndim() != values.ndim() {
            return Err(ModelgenError::ShapeMismatch {
                variable: key.to_string(),
                expected: slot.ndim(),
                got: values.shape().to_vec(),
            });
        }
        let element = slot.element;
        let resized = slot.values.shape() != values.shape();
        slot.values = values.mapv(|v| cast(element, v));
        if resized {
            if let Some(old_key) = self.old_key(key) {
                let fresh = self.slot(key)?.values.clone();
                self.slot_mut(&old_key)?.values = fresh;
            }
        }
        Ok(())
    }

    /// Resize a variable to `shape`, filling it with zeros.
    pub fn set_shape(&mut self, key: &str, shape: &[usize]) -> ModelgenResult<()> {
        let ndim = self.slot(key)?.ndim();
        if ndim != shape.len() {
            return Err(ModelgenError::ShapeMismatch {
                variable: key.to_string(),
                expected: ndim,
                got: shape.to_vec(),
            });
        }
        self.set_array(key, ArrayD::zeros(IxDyn(shape)))
    }

    fn old_key(&self, key: &str) -> Option<String> {
        let slot = self.slots.get(key)?;
        (slot.path.group == GroupRef::Kind(GroupKind::States)).then(|| {
            VarPath {
                group: GroupRef::OldStates,
                ..slot.path.clone()
            }
            .slot_key()
        })
    }

    /// Read one element.
    pub fn read(&self, path: &VarPath, index: &[i64]) -> ModelgenResult<f64> {
        let key = path.slot_key();
        let slot = self.slot(&key)?;
        let index = checked_index(&key, slot, index)?;
        Ok(slot.values[IxDyn(&index)])
    }

    /// Write one element, cast to the variable's element type.
    pub fn write(&mut self, path: &VarPath, index: &[i64], value: f64) -> ModelgenResult<()> {
        let key = path.slot_key();
        let slot = self.slot_mut(&key)?;
        let index = checked_index(&key, slot, index)?;
        slot.values[IxDyn(&index)] = cast(slot.element, value);
        Ok(())
    }

    /// Values in row-major order.
    pub fn flat(&self, key: &str) -> ModelgenResult<Vec<f64>> {
        Ok(self.get(key)?.iter().copied().collect())
    }

    /// Overwrite all values in row-major order; the shape stays unchanged.
    pub fn set_flat(&mut self, key: &str, values: &[f64]) -> ModelgenResult<()> {
        let slot = self.slot_mut(key)?;
        if slot.values.len() != values.len() {
            return Err(ModelgenError::ShapeMismatch {
                variable: key.to_string(),
                expected: slot.ndim(),
                got: vec![values.len()],
            });
        }
        let element = slot.element;
        for (target, value) in slot.values.iter_mut().zip(values) {
            *target = cast(element, *value);
        }
        Ok(())
    }

    /// Copy every state, including those of sub-models, to its previous-step slot.
    pub fn new2old(&mut self) {
        let pairs: Vec<(String, String)> = self
            .slots
            .keys()
            .filter_map(|key| self.old_key(key).map(|old| (key.clone(), old)))
            .collect();
        for (new, old) in pairs {
            if let Some(values) = self.slots.get(&new).map(|s| s.values.clone()) {
                if let Some(slot) = self.slots.get_mut(&old) {
                    slot.values = values;
                }
            }
        }
    }
}

fn checked_index(key: &str, slot: &Slot, index: &[i64]) -> ModelgenResult<Vec<usize>> {
    let shape = slot.values.shape();
    let out_of_bounds = || ModelgenError::IndexOutOfBounds {
        variable: key.to_string(),
        index: index.to_vec(),
        shape: shape.to_vec(),
    };
    if index.len() != shape.len() {
        return Err(out_of_bounds());
    }
    index
        .iter()
        .zip(shape)
        .map(|(i, len)| {
            usize::try_from(*i)
                .ok()
                .filter(|i| i < len)
                .ok_or_else(out_of_bounds)
        })
        .collect()
}
