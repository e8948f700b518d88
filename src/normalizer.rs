use std::sync::OnceLock;

use regex::Regex;

/// Sentinel marking the single position where a server-assigned prepared
/// statement handle is substituted before execution.
pub const HANDLE_PLACEHOLDER: char = '§';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Regular,
    Prepare,
    Execute,
    Unprepare,
    ResetConn,
    ResetConnNonpooled,
}

/// Classification of a raw command text, produced by [`normalize`].
///
/// `source_handle_id` is present for the handle-bearing kinds (`Prepare`,
/// `Execute`, `Unprepare`) and names the statement handle observed on the
/// *source* side of the capture. For `Execute` and `Unprepare` the
/// `normalized_text` contains [`HANDLE_PLACEHOLDER`] where the server-side
/// handle belongs; for `Prepare` it is rewritten so that executing it returns
/// the freshly assigned server handle as a scalar.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedCommand {
    pub kind: CommandKind,
    pub normalized_text: String,
    pub source_handle_id: Option<i64>,
}

impl NormalizedCommand {
    fn regular(text: &str) -> Self {
        Self {
            kind: CommandKind::Regular,
            normalized_text: text.to_string(),
            source_handle_id: None,
        }
    }
}

fn reset_connection_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:exec(?:ute)?\s+)?sp_reset_connection(?P<nonpooled>\s*\(?\s*nonpooled\s*\)?)?\s*;?\s*$")
            .expect("reset-connection pattern is valid")
    })
}

fn prepare_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?is)^\s*declare\s+@p(?P<var>\d+)\s+int\b\s*;?\s*set\s+@p\d+\s*=\s*(?P<handle>\d+)\s*;?\s*(?P<body>exec(?:ute)?\s+sp_prepare\s+.*)$",
        )
        .expect("prepare pattern is valid")
    })
}

fn prepare_trailing_select_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)\s*;?\s*select\s+@p\d+\s*;?\s*$").expect("trailing-select pattern is valid")
    })
}

fn execute_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)^\s*exec(?:ute)?\s+sp_execute\s+(?P<handle>\d+)").expect("execute pattern is valid")
    })
}

fn unprepare_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)^\s*exec(?:ute)?\s+sp_unprepare\s+(?P<handle>\d+)").expect("unprepare pattern is valid")
    })
}

/// Classifies a command text into one of the six command kinds.
///
/// This is a pure function: identical input always yields identical output.
/// Texts that superficially resemble a session-control command but do not
/// match its full shape fall through to `Regular` and are executed verbatim.
pub fn normalize(text: &str) -> NormalizedCommand {
    if let Some(caps) = reset_connection_re().captures(text) {
        let kind = if caps.name("nonpooled").is_some() {
            CommandKind::ResetConnNonpooled
        } else {
            CommandKind::ResetConn
        };
        return NormalizedCommand {
            kind,
            normalized_text: text.to_string(),
            source_handle_id: None,
        };
    }

    if let Some(caps) = prepare_re().captures(text) {
        let Ok(handle) = caps["handle"].parse::<i64>() else {
            return NormalizedCommand::regular(text);
        };
        let var = &caps["var"];
        // Drop the captured handle assignment so the server assigns a fresh
        // one, and make sure the statement returns it as a scalar.
        let body = prepare_trailing_select_re().replace(&caps["body"], "");
        return NormalizedCommand {
            kind: CommandKind::Prepare,
            normalized_text: format!("declare @p{var} int\n{body}\nselect @p{var}"),
            source_handle_id: Some(handle),
        };
    }

    if let Some(caps) = execute_re().captures(text) {
        let m = caps.name("handle").expect("execute pattern always captures a handle");
        if let Ok(handle) = m.as_str().parse::<i64>() {
            return NormalizedCommand {
                kind: CommandKind::Execute,
                normalized_text: replace_span(text, m.start(), m.end()),
                source_handle_id: Some(handle),
            };
        }
        return NormalizedCommand::regular(text);
    }

    if let Some(caps) = unprepare_re().captures(text) {
        let m = caps.name("handle").expect("unprepare pattern always captures a handle");
        if let Ok(handle) = m.as_str().parse::<i64>() {
            return NormalizedCommand {
                kind: CommandKind::Unprepare,
                normalized_text: replace_span(text, m.start(), m.end()),
                source_handle_id: Some(handle),
            };
        }
        return NormalizedCommand::regular(text);
    }

    NormalizedCommand::regular(text)
}

/// Substitutes the first [`HANDLE_PLACEHOLDER`] in `text` with the server
/// handle rendered as a decimal string. Later occurrences are left alone.
pub fn substitute_handle(text: &str, server_handle: i64) -> String {
    match text.find(HANDLE_PLACEHOLDER) {
        Some(pos) => {
            let mut out = String::with_capacity(text.len() + 20);
            out.push_str(&text[..pos]);
            out.push_str(&server_handle.to_string());
            out.push_str(&text[pos + HANDLE_PLACEHOLDER.len_utf8()..]);
            out
        }
        None => text.to_string(),
    }
}

fn replace_span(text: &str, start: usize, end: usize) -> String {
    let mut out = String::with_capacity(text.len());
    out.push_str(&text[..start]);
    out.push(HANDLE_PLACEHOLDER);
    out.push_str(&text[end..]);
    out
}

#[cfg(test)]
mod tests {
    use super::{normalize, substitute_handle, CommandKind};

    #[test]
    fn plain_select_is_regular() {
        let normalized = normalize("SELECT 1");
        assert_eq!(normalized.kind, CommandKind::Regular);
        assert_eq!(normalized.normalized_text, "SELECT 1");
        assert_eq!(normalized.source_handle_id, None);
    }

    #[test]
    fn reset_connection_variants() {
        for text in [
            "exec sp_reset_connection",
            "EXEC sp_reset_connection;",
            "sp_reset_connection",
            "  execute sp_reset_connection  ",
        ] {
            assert_eq!(normalize(text).kind, CommandKind::ResetConn, "text `{text}`");
        }
    }

    #[test]
    fn nonpooled_reset_is_distinguished() {
        for text in [
            "exec sp_reset_connection nonpooled",
            "exec sp_reset_connection (nonpooled)",
        ] {
            assert_eq!(
                normalize(text).kind,
                CommandKind::ResetConnNonpooled,
                "text `{text}`"
            );
        }
    }

    #[test]
    fn prepare_extracts_source_handle_and_returns_scalar() {
        let text = "declare @p1 int\nset @p1=5\nexec sp_prepare @p1 output,N'@P0 int',N'select * from t where id=@P0',1\nselect @p1";
        let normalized = normalize(text);
        assert_eq!(normalized.kind, CommandKind::Prepare);
        assert_eq!(normalized.source_handle_id, Some(5));
        assert!(
            normalized.normalized_text.ends_with("select @p1"),
            "normalized prepare must return the handle: {}",
            normalized.normalized_text
        );
        assert!(
            !normalized.normalized_text.contains("set @p1=5"),
            "captured handle assignment must be dropped: {}",
            normalized.normalized_text
        );
    }

    #[test]
    fn prepare_without_trailing_select_gains_one() {
        let text = "declare @p2 int\nset @p2=12\nexec sp_prepare @p2 output,N'@P0 int',N'select 1',1";
        let normalized = normalize(text);
        assert_eq!(normalized.kind, CommandKind::Prepare);
        assert_eq!(normalized.source_handle_id, Some(12));
        assert!(normalized.normalized_text.ends_with("select @p2"));
    }

    #[test]
    fn execute_replaces_handle_with_placeholder() {
        let normalized = normalize("exec sp_execute 7,N'abc',42");
        assert_eq!(normalized.kind, CommandKind::Execute);
        assert_eq!(normalized.source_handle_id, Some(7));
        assert_eq!(normalized.normalized_text, "exec sp_execute §,N'abc',42");
    }

    #[test]
    fn unprepare_replaces_handle_with_placeholder() {
        let normalized = normalize("exec sp_unprepare 7");
        assert_eq!(normalized.kind, CommandKind::Unprepare);
        assert_eq!(normalized.source_handle_id, Some(7));
        assert_eq!(normalized.normalized_text, "exec sp_unprepare §");
    }

    #[test]
    fn lookalike_texts_fall_back_to_regular() {
        for text in [
            "select 'exec sp_execute 7'",
            "exec sp_executesql N'select 1'",
            "-- sp_prepare in a comment",
        ] {
            assert_eq!(normalize(text).kind, CommandKind::Regular, "text `{text}`");
        }
    }

    #[test]
    fn substitution_replaces_only_the_first_placeholder() {
        assert_eq!(substitute_handle("exec sp_execute §,§", 42), "exec sp_execute 42,§");
        assert_eq!(substitute_handle("no placeholder", 42), "no placeholder");
    }
}
