//! Renders a verdict into the HTML report carried in the reply's `msg`.

use std::sync::OnceLock;

use tera::{Context, Tera};

use crate::protocol::envelope::Reply;

use super::verdict::Verdict;

const REPORT_TEMPLATE: &str = r#"
<div class="test">
<header>Test results</header>
  <section>
    <div class="shortform">
    {{ status }}
    </div>
    <div class="longform">
      {{ errors | safe }}
      {{ results | safe }}
    </div>
  </section>
</div>
"#;

const ERRORS_TEMPLATE: &str = r#"<div class="result-errors">
<ul>
{% for error in errors %}<li><pre>{{ error }}</pre></li>
{% endfor %}</ul>
</div>"#;

const CORRECT_TEMPLATE: &str = r#"
  <div class="result-output result-correct">
    <h4>{{ short_description }}</h4>
    {% if detailed_description %}<p>{{ detailed_description }}</p>{% endif %}
    <dl>
    <dt>Output:</dt>
    <dd class="result-actual-output">
       <pre>{{ actual_output }}</pre>
       </dd>
    </dl>
  </div>
"#;

const INCORRECT_TEMPLATE: &str = r#"
  <div class="result-output result-incorrect">
    <h4>{{ short_description }}</h4>
    {% if detailed_description %}<p>{{ detailed_description }}</p>{% endif %}
    <dl>
    <dt>Your output:</dt>
    <dd class="result-actual-output"><pre>{{ actual_output }}</pre></dd>
    <dt>Correct output:</dt>
    <dd><pre>{{ expected_output }}</pre></dd>
    </dl>
  </div>
"#;

fn templates() -> &'static Tera {
    static TEMPLATES: OnceLock<Tera> = OnceLock::new();
    TEMPLATES.get_or_init(|| {
        let mut tera = Tera::default();
        // The .html suffix turns on auto-escaping for interpolated fields.
        tera.add_raw_templates(vec![
            ("report.html", REPORT_TEMPLATE),
            ("errors.html", ERRORS_TEMPLATE),
            ("test_correct.html", CORRECT_TEMPLATE),
            ("test_incorrect.html", INCORRECT_TEMPLATE),
        ])
        .unwrap_or_else(|err| panic!("built-in report templates are invalid: {err}"));
        tera
    })
}

/// Renders the full report: status banner, error list, per-test blocks.
pub fn render_results(verdict: &Verdict) -> Result<String, tera::Error> {
    let tera = templates();

    let mut results = String::new();
    for test in &verdict.tests {
        let name = if test.correct {
            "test_correct.html"
        } else {
            "test_incorrect.html"
        };
        let mut context = Context::new();
        context.insert("short_description", &test.short_description);
        context.insert("detailed_description", &test.detailed_description);
        context.insert("expected_output", &test.expected_output);
        context.insert("actual_output", &test.actual_output);
        results.push_str(&tera.render(name, &context)?);
    }

    let errors = if verdict.errors.is_empty() {
        String::new()
    } else {
        let mut context = Context::new();
        context.insert("errors", &verdict.errors);
        tera.render("errors.html", &context)?
    };

    let status = if !verdict.errors.is_empty() {
        "ERROR"
    } else if verdict.correct {
        "CORRECT"
    } else {
        "INCORRECT"
    };

    let mut context = Context::new();
    context.insert("status", status);
    context.insert("errors", &errors);
    context.insert("results", &results);
    tera.render("report.html", &context)
}

/// Renders a verdict into the wire reply.
pub fn render_reply(verdict: &Verdict) -> Result<Reply, tera::Error> {
    let msg = render_results(verdict)?;
    Ok(Reply::new(verdict.correct, verdict.score, msg))
}
