//! Textual rewrite of alert rule templates.
//!
//! A definition's `template` is opaque text, typically YAML describing one
//! alert rule. A new version materialises its effective duration and
//! threshold into the text: the `duration:` and `threshold:` labels are
//! rewritten in place, and the right-hand side of the `> N` comparison in
//! the `expr:` line is replaced. Everything else round-trips untouched.

/// Render `template` with the given effective values.
///
/// Duration is formatted as `"<n>s"`; the threshold is written bare.
pub fn render(template: &str, duration_secs: i64, threshold: i64) -> String {
    let mut out: Vec<String> = template
        .lines()
        .map(|line| rewrite_line(line, duration_secs, threshold))
        .collect();
    if template.ends_with('\n') {
        out.push(String::new());
    }
    out.join("\n")
}

fn rewrite_line(line: &str, duration_secs: i64, threshold: i64) -> String {
    if let Some(prefix) = label_prefix(line, "duration:") {
        return format!("{prefix} {duration_secs}s");
    }
    if let Some(prefix) = label_prefix(line, "threshold:") {
        return format!("{prefix} {threshold}");
    }
    if label_prefix(line, "expr:").is_some() {
        if let Some(idx) = line.rfind('>') {
            return format!("{} {threshold}", line[..=idx].trim_end());
        }
    }
    line.to_string()
}

/// If the line's content (after indentation and an optional list dash) is
/// `label ...`, return the slice up to and including the label.
fn label_prefix<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    let trimmed = line.trim_start();
    let content = trimmed.strip_prefix("- ").unwrap_or(trimmed);
    if content.starts_with(label) {
        let end = line.len() - trimmed.len() + (trimmed.len() - content.len()) + label.len();
        Some(&line[..end])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = "alert: HighCpu\n\
        expr: avg(cpu_usage) > 5\n\
        duration: 30s\n\
        threshold: 5\n\
        labels:\n  severity: critical\n";

    #[test]
    fn rewrites_duration_threshold_and_expr() {
        let rendered = render(TEMPLATE, 45, 10);
        assert!(rendered.contains("duration: 45s"));
        assert!(rendered.contains("threshold: 10"));
        assert!(rendered.contains("expr: avg(cpu_usage) > 10"));
        assert!(rendered.contains("severity: critical"));
        assert!(rendered.ends_with('\n'));
    }

    #[test]
    fn rendering_is_idempotent() {
        let once = render(TEMPLATE, 45, 10);
        let twice = render(&once, 45, 10);
        assert_eq!(once, twice);
    }

    #[test]
    fn keeps_indented_labels_in_place() {
        let template = "rule:\n  duration: 10s\n  threshold: 2\n";
        let rendered = render(template, 60, 8);
        assert_eq!(rendered, "rule:\n  duration: 60s\n  threshold: 8\n");
    }

    #[test]
    fn rewrites_list_item_expr() {
        let template = "rules:\n- expr: errors_total > 1\n- duration: 5s\n";
        let rendered = render(template, 20, 3);
        assert!(rendered.contains("- expr: errors_total > 3"));
        assert!(rendered.contains("- duration: 20s"));
    }

    #[test]
    fn leaves_unrelated_lines_untouched() {
        let template = "for: 5m\nexpr_description: latency\n";
        assert_eq!(render(template, 1, 1), template);
    }
}
