//! Compute pipeline construction.

use std::borrow::Cow;

use crate::context::WgpuContext;

/// Builder for compute pipelines.
///
/// WGSL has no preprocessor; [`define`](Self::define) substitutes `{{NAME}}`
/// tokens in the source before the module is compiled.
pub struct ComputePipelineBuilder<'a> {
    ctx: &'a WgpuContext,
    label: Option<&'a str>,
    shader_source: Option<Cow<'a, str>>,
    defines: Vec<(&'a str, String)>,
    entry_point: &'a str,
    bind_group_layouts: Vec<&'a wgpu::BindGroupLayout>,
}

impl<'a> ComputePipelineBuilder<'a> {
    pub fn new(ctx: &'a WgpuContext) -> Self {
        Self {
            ctx,
            label: None,
            shader_source: None,
            defines: Vec::new(),
            entry_point: "cs_main",
            bind_group_layouts: Vec::new(),
        }
    }

    pub fn label(mut self, label: &'a str) -> Self {
        self.label = Some(label);
        self
    }

    /// Set the shader source (WGSL).
    pub fn shader(mut self, source: impl Into<Cow<'a, str>>) -> Self {
        self.shader_source = Some(source.into());
        self
    }

    /// Replace every `{{name}}` in the source with `value`.
    pub fn define(mut self, name: &'a str, value: impl ToString) -> Self {
        self.defines.push((name, value.to_string()));
        self
    }

    pub fn entry_point(mut self, entry: &'a str) -> Self {
        self.entry_point = entry;
        self
    }

    /// Add a bind group layout. Group indices follow call order.
    pub fn bind_group_layout(mut self, layout: &'a wgpu::BindGroupLayout) -> Self {
        self.bind_group_layouts.push(layout);
        self
    }

    pub fn build(self) -> anyhow::Result<wgpu::ComputePipeline> {
        let source = self
            .shader_source
            .ok_or_else(|| anyhow::anyhow!("Shader source is required"))?;
        let source = if self.defines.is_empty() {
            source
        } else {
            Cow::Owned(expand_defines(&source, &self.defines)?)
        };

        let shader_module = self
            .ctx
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: self.label,
                source: wgpu::ShaderSource::Wgsl(source),
            });

        let pipeline_layout =
            self.ctx
                .device
                .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: self.label,
                    bind_group_layouts: &self.bind_group_layouts,
                    immediate_size: 0,
                });

        Ok(self
            .ctx
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: self.label,
                layout: Some(&pipeline_layout),
                module: &shader_module,
                entry_point: Some(self.entry_point),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            }))
    }
}

/// Substitute `{{name}}` tokens. Fails if any token is left unresolved.
fn expand_defines(source: &str, defines: &[(&str, String)]) -> anyhow::Result<String> {
    let mut expanded = source.to_owned();
    for (name, value) in defines {
        expanded = expanded.replace(&format!("{{{{{name}}}}}"), value);
    }
    if let Some(start) = expanded.find("{{") {
        let token: String = expanded[start..].chars().take(32).collect();
        anyhow::bail!("unresolved shader define near `{token}`");
    }
    Ok(expanded)
}
