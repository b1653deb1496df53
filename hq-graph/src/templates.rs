use indexmap::IndexMap;
use thiserror::Error;

use crate::graph::LayerKind;

/// The code generation templates of a layer kind.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LayerTemplates {
    pub function: String,
    pub config: String,
}

/// Maps layer kinds to their code generation templates.
///
/// Kinds that are computed exactly like another kind are registered as an alias,
/// so they share that kind's templates instead of duplicating them.
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: IndexMap<LayerKind, LayerTemplates>,
    aliases: IndexMap<LayerKind, LayerKind>,
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum TemplateError {
    #[error("no templates registered for `{0}`")]
    Unregistered(LayerKind),
    #[error("`{0}` already has templates")]
    AlreadyRegistered(LayerKind),
}

impl TemplateRegistry {
    pub fn empty() -> Self {
        TemplateRegistry {
            templates: IndexMap::new(),
            aliases: IndexMap::new(),
        }
    }

    pub fn register(&mut self, kind: LayerKind, function: &str, config: &str) -> Result<(), TemplateError> {
        if self.get(kind).is_some() {
            return Err(TemplateError::AlreadyRegistered(kind));
        }
        let templates = LayerTemplates {
            function: function.to_owned(),
            config: config.to_owned(),
        };
        self.templates.insert(kind, templates);
        Ok(())
    }

    /// Let `kind` use the templates of `existing`.
    pub fn register_alias(&mut self, kind: LayerKind, existing: LayerKind) -> Result<(), TemplateError> {
        if self.get(kind).is_some() {
            return Err(TemplateError::AlreadyRegistered(kind));
        }
        let target = self.resolve(existing).ok_or(TemplateError::Unregistered(existing))?;
        self.aliases.insert(kind, target);
        Ok(())
    }

    fn resolve(&self, kind: LayerKind) -> Option<LayerKind> {
        let kind = self.aliases.get(&kind).copied().unwrap_or(kind);
        self.templates.contains_key(&kind).then_some(kind)
    }

    pub fn get(&self, kind: LayerKind) -> Option<&LayerTemplates> {
        self.templates.get(&self.resolve(kind)?)
    }

    pub fn is_alias(&self, kind: LayerKind) -> bool {
        self.aliases.contains_key(&kind)
    }
}

impl Default for TemplateRegistry {
    /// The built-in layer templates, with `ApplyAlpha` sharing the batch normalization templates.
    fn default() -> Self {
        let builtin = [
            (LayerKind::Dense, "nnet::dense", "dense_config"),
            (LayerKind::Conv1D, "nnet::conv_1d_cl", "conv1d_config"),
            (LayerKind::Conv2D, "nnet::conv_2d_cl", "conv2d_config"),
            (LayerKind::BatchNormalization, "nnet::normalize", "batchnorm_config"),
            (LayerKind::Activation, "nnet::activation", "activ_config"),
        ];

        let mut registry = TemplateRegistry::empty();
        for (kind, function, config) in builtin {
            registry.templates.insert(
                kind,
                LayerTemplates {
                    function: function.to_owned(),
                    config: config.to_owned(),
                },
            );
        }
        registry
            .aliases
            .insert(LayerKind::ApplyAlpha, LayerKind::BatchNormalization);

        registry
    }
}
