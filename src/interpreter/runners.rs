//! Embedded kernel runner scripts.
//!
//! Each runner keeps a persistent namespace for its context, reads requests
//! from stdin, and emits JSON-line events on stdout: `ready` once at boot,
//! then per execution `stdout`/`stderr`/`result`/`error` and a final
//! `execution_complete`. Python and JavaScript take JSON-line requests
//! (`{"id", "code"}`); R takes an id line, a line-count line, then that many
//! raw code lines, because parsing JSON from base R is not worth the trip.

pub const PYTHON_RUNNER: &str = r#"
import ast
import contextlib
import io
import json
import sys
import traceback


def emit(obj):
    sys.stdout.write(json.dumps(obj) + "\n")
    sys.stdout.flush()


class Forwarder(io.TextIOBase):
    def __init__(self, kind):
        self.kind = kind
        self.rid = None

    def writable(self):
        return True

    def write(self, text):
        if text:
            emit({"id": self.rid, "type": self.kind, "text": text})
        return len(text)


scope = {"__name__": "__main__"}
stdout_fwd = Forwarder("stdout")
stderr_fwd = Forwarder("stderr")
execution_count = 0

emit({"type": "ready"})

for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    try:
        request = json.loads(line)
    except ValueError:
        continue
    rid = request.get("id", "")
    code = request.get("code", "")
    stdout_fwd.rid = rid
    stderr_fwd.rid = rid
    execution_count += 1
    try:
        tree = ast.parse(code)
        trailing = None
        if tree.body and isinstance(tree.body[-1], ast.Expr):
            trailing = ast.Expression(tree.body[-1].value)
            tree.body = tree.body[:-1]
        with contextlib.redirect_stdout(stdout_fwd), contextlib.redirect_stderr(stderr_fwd):
            if tree.body:
                exec(compile(tree, "<code>", "exec"), scope)
            if trailing is not None:
                value = eval(compile(trailing, "<code>", "eval"), scope)
                if value is not None:
                    emit({
                        "id": rid,
                        "type": "result",
                        "text": repr(value),
                        "execution_count": execution_count,
                    })
    except BaseException:
        etype, evalue, tb = sys.exc_info()
        emit({
            "id": rid,
            "type": "error",
            "ename": etype.__name__,
            "evalue": str(evalue),
            "traceback": traceback.format_exception(etype, evalue, tb),
        })
    emit({"id": rid, "type": "execution_complete", "execution_count": execution_count})
"#;

pub const JAVASCRIPT_RUNNER: &str = r#"
const readline = require("readline");
const util = require("util");
const vm = require("vm");

function emit(obj) {
  process.stdout.write(JSON.stringify(obj) + "\n");
}

let currentId = null;
let executionCount = 0;

const sandbox = {
  require: require,
  setTimeout: setTimeout,
  clearTimeout: clearTimeout,
  Buffer: Buffer,
  console: null,
};
function line(kind) {
  return (...args) => emit({ id: currentId, type: kind, text: util.format(...args) + "\n" });
}
sandbox.console = {
  log: line("stdout"),
  info: line("stdout"),
  warn: line("stderr"),
  error: line("stderr"),
};
vm.createContext(sandbox);

emit({ type: "ready" });

const rl = readline.createInterface({ input: process.stdin, terminal: false });
rl.on("line", (raw) => {
  const trimmed = raw.trim();
  if (!trimmed) return;
  let request;
  try {
    request = JSON.parse(trimmed);
  } catch (err) {
    return;
  }
  currentId = request.id || null;
  executionCount += 1;
  try {
    const value = vm.runInContext(request.code || "", sandbox, { filename: "<code>" });
    if (value !== undefined) {
      emit({
        id: currentId,
        type: "result",
        text: util.inspect(value),
        execution_count: executionCount,
      });
    }
  } catch (err) {
    emit({
      id: currentId,
      type: "error",
      ename: (err && err.name) || "Error",
      evalue: (err && err.message) || String(err),
      traceback: err && err.stack ? err.stack.split("\n") : [],
    });
  }
  emit({ id: currentId, type: "execution_complete", execution_count: executionCount });
});
"#;

pub const R_RUNNER: &str = r#"
json_escape <- function(s) {
  s <- gsub("\\", "\\\\", s, fixed = TRUE)
  s <- gsub("\"", "\\\"", s, fixed = TRUE)
  s <- gsub("\n", "\\n", s, fixed = TRUE)
  s <- gsub("\r", "\\r", s, fixed = TRUE)
  s <- gsub("\t", "\\t", s, fixed = TRUE)
  s
}

emit <- function(...) {
  cat(..., "\n", sep = "")
  flush(stdout())
}

emit("{\"type\":\"ready\"}")

.ruche_input <- file("stdin", open = "r")
.ruche_count <- 0

repeat {
  .ruche_id <- readLines(.ruche_input, n = 1)
  if (length(.ruche_id) == 0) break
  .ruche_n_raw <- readLines(.ruche_input, n = 1)
  if (length(.ruche_n_raw) == 0) break
  .ruche_n <- suppressWarnings(as.integer(.ruche_n_raw))
  if (is.na(.ruche_n) || .ruche_n < 0) next
  .ruche_code <- if (.ruche_n > 0) {
    paste(readLines(.ruche_input, n = .ruche_n), collapse = "\n")
  } else {
    ""
  }
  .ruche_count <- .ruche_count + 1
  .ruche_ok <- TRUE
  .ruche_err <- ""
  .ruche_has_value <- FALSE
  .ruche_value <- NULL
  .ruche_output <- tryCatch(
    capture.output({
      .ruche_res <- withVisible(eval(parse(text = .ruche_code), envir = globalenv()))
      if (.ruche_res$visible && !is.null(.ruche_res$value)) {
        .ruche_has_value <- TRUE
        .ruche_value <- .ruche_res$value
      }
    }),
    error = function(e) {
      .ruche_ok <<- FALSE
      .ruche_err <<- conditionMessage(e)
      character(0)
    }
  )
  if (length(.ruche_output) > 0) {
    emit("{\"id\":\"", json_escape(.ruche_id), "\",\"type\":\"stdout\",\"text\":\"",
         json_escape(paste(.ruche_output, collapse = "\n")), "\\n\"}")
  }
  if (.ruche_ok && .ruche_has_value) {
    .ruche_text <- paste(capture.output(print(.ruche_value)), collapse = "\n")
    emit("{\"id\":\"", json_escape(.ruche_id), "\",\"type\":\"result\",\"text\":\"",
         json_escape(.ruche_text), "\",\"execution_count\":", .ruche_count, "}")
  }
  if (!.ruche_ok) {
    emit("{\"id\":\"", json_escape(.ruche_id), "\",\"type\":\"error\",\"ename\":\"Error\",\"evalue\":\"",
         json_escape(.ruche_err), "\",\"traceback\":[]}")
  }
  emit("{\"id\":\"", json_escape(.ruche_id), "\",\"type\":\"execution_complete\",\"execution_count\":",
       .ruche_count, "}")
}
"#;

/// Encodes one execution request in the framing the language's runner reads.
pub fn encode_request(
    language: crate::interpreter::Language,
    execution_id: &str,
    code: &str,
) -> String {
    match language {
        crate::interpreter::Language::Python | crate::interpreter::Language::Javascript => {
            let request = serde_json::json!({ "id": execution_id, "code": code });
            format!("{}\n", request)
        }
        crate::interpreter::Language::R => {
            let lines: Vec<&str> = if code.is_empty() {
                Vec::new()
            } else {
                code.split('\n').collect()
            };
            let mut framed = format!("{}\n{}\n", execution_id, lines.len());
            for line in lines {
                framed.push_str(line);
                framed.push('\n');
            }
            framed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::Language;

    #[test]
    fn json_languages_frame_as_one_line() {
        let framed = encode_request(Language::Python, "e1", "print(1)\nprint(2)");
        assert_eq!(framed.matches('\n').count(), 1);
        let parsed: serde_json::Value = serde_json::from_str(framed.trim()).unwrap();
        assert_eq!(parsed["id"], "e1");
        assert_eq!(parsed["code"], "print(1)\nprint(2)");
    }

    #[test]
    fn r_framing_carries_line_count() {
        let framed = encode_request(Language::R, "e2", "x <- 1\nx");
        let mut lines = framed.lines();
        assert_eq!(lines.next(), Some("e2"));
        assert_eq!(lines.next(), Some("2"));
        assert_eq!(lines.next(), Some("x <- 1"));
        assert_eq!(lines.next(), Some("x"));
    }

    #[test]
    fn r_framing_of_empty_code_is_zero_lines() {
        let framed = encode_request(Language::R, "e3", "");
        assert_eq!(framed, "e3\n0\n");
    }
}
