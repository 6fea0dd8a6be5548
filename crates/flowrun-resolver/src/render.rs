use flowrun_config::Flow;
use flowrun_model::{Execution, TaskRun};
use minijinja::Environment;
use serde_json::{Value, json};

/// A template failed to render.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct RenderError(pub String);

/// Renders `{{ }}` expressions against execution variables.
pub trait Renderer: Send + Sync {
  fn render(&self, template: &str, variables: &Value) -> Result<String, RenderError>;
}

/// [`Renderer`] backed by minijinja.
pub struct MiniJinjaRenderer {
  env: Environment<'static>,
}

impl MiniJinjaRenderer {
  pub fn new() -> Self {
    Self {
      env: Environment::new(),
    }
  }
}

impl Default for MiniJinjaRenderer {
  fn default() -> Self {
    Self::new()
  }
}

impl Renderer for MiniJinjaRenderer {
  fn render(&self, template: &str, variables: &Value) -> Result<String, RenderError> {
    // plain strings are by far the most common, skip the template engine
    if !template.contains("{{") && !template.contains("{%") {
      return Ok(template.to_string());
    }

    let ctx = minijinja::Value::from_serialize(variables);
    self
      .env
      .render_str(template, ctx)
      .map_err(|e| RenderError(e.to_string()))
  }
}

/// Variables a task of `execution` is rendered against.
///
/// ```text
/// { execution, flow, inputs, outputs, taskrun: { id, value, parent_id, attempts_count }, parents }
/// ```
///
/// `parents` lists the ancestors of `task_run`, closest first, each as
/// `{ taskrun: { id, value } }`.
pub fn variables(flow: &Flow, execution: &Execution, task_run: Option<&TaskRun>) -> Value {
  let mut vars = json!({
    "execution": {
      "id": execution.id,
      "namespace": execution.namespace,
      "flow_id": execution.flow_id,
      "state": execution.state.current,
      "start_date": execution.state.start_date(),
    },
    "flow": {
      "namespace": flow.namespace,
      "id": flow.id,
      "revision": flow.revision,
    },
    "inputs": execution.inputs,
    "outputs": execution.outputs(),
  });

  if let Some(task_run) = task_run {
    let parents: Vec<Value> = execution
      .find_parents(task_run)
      .into_iter()
      .rev()
      .map(|parent| json!({ "taskrun": { "id": parent.id, "value": parent.value } }))
      .collect();

    vars["taskrun"] = json!({
      "id": task_run.id,
      "value": task_run.value,
      "parent_id": task_run.parent_task_run_id,
      "attempts_count": task_run.attempt_count(),
    });
    vars["parents"] = Value::Array(parents);
  }

  vars
}

/// Render every string found in `value`, recursing into arrays and objects.
pub fn render_value(
  renderer: &dyn Renderer,
  value: &Value,
  variables: &Value,
) -> Result<Value, RenderError> {
  match value {
    Value::String(template) => renderer.render(template, variables).map(Value::String),
    Value::Array(items) => items
      .iter()
      .map(|item| render_value(renderer, item, variables))
      .collect::<Result<Vec<_>, _>>()
      .map(Value::Array),
    Value::Object(map) => {
      let mut rendered = serde_json::Map::with_capacity(map.len());
      for (key, item) in map {
        rendered.insert(key.clone(), render_value(renderer, item, variables)?);
      }
      Ok(Value::Object(rendered))
    }
    other => Ok(other.clone()),
  }
}

/// Truthiness of a rendered condition.
pub fn is_truthy(rendered: &str) -> bool {
  let rendered = rendered.trim();
  !(rendered.is_empty()
    || rendered == "0"
    || rendered == "-0"
    || rendered.eq_ignore_ascii_case("false")
    || rendered.eq_ignore_ascii_case("none")
    || rendered.eq_ignore_ascii_case("null"))
}
