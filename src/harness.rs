//! Worker wire protocol and the embedded Python harness.
//!
//! The executor writes one [`WorkerRequest`] as a JSON line to the worker's
//! stdin. The worker answers with one [`WorkerResponse`] printed between
//! sentinel lines on stdout, so stray output from native libraries cannot
//! corrupt the channel.

use crate::datasets::DatasetFormat;
use crate::errors::{Result, SandboxError};
use crate::extractor::RenderedFigure;
use crate::types::{ImageFormat, InjectedImport};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const RESULT_START: &str = "__PLOTSANDBOX_RESULT_START__";
pub const RESULT_END: &str = "__PLOTSANDBOX_RESULT_END__";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerDataset {
    pub alias: String,
    pub path: PathBuf,
    pub format: DatasetFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub code: String,
    pub datasets: Vec<WorkerDataset>,
    pub injected_imports: Vec<InjectedImport>,
    pub allowed_modules: Vec<String>,
    pub denied_submodules: Vec<String>,
    pub artifact_path: PathBuf,
    pub format: ImageFormat,
    pub dpi: u32,
    pub tight_bbox: bool,
    pub enforce_style: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Success,
    RuntimeError,
    SyntaxError,
    /// The harness itself failed before or around user code
    SetupError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub status: WorkerStatus,
    /// Base64 artifact bytes
    #[serde(default)]
    pub artifact: Option<String>,
    #[serde(default)]
    pub figure: Option<RenderedFigure>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// Line in the submitted code, when the error originated there
    #[serde(default)]
    pub line: Option<usize>,
    #[serde(default)]
    pub phase: Option<String>,
    /// Captured `print` output of the submission, truncated
    #[serde(default)]
    pub output: Option<String>,
}

impl WorkerResponse {
    pub fn is_memory_error(&self) -> bool {
        self.error_type.as_deref() == Some("MemoryError")
    }

    /// `ValueError: bad input (line 4)`
    pub fn describe_error(&self) -> String {
        let error_type = self.error_type.as_deref().unwrap_or("Error");
        let message = self.message.as_deref().unwrap_or("").trim();
        let mut text = if message.is_empty() {
            error_type.to_string()
        } else {
            format!("{error_type}: {message}")
        };
        if let Some(line) = self.line {
            text.push_str(&format!(" (line {line})"));
        }
        text
    }
}

/// Extract the response document from the worker's stdout.
pub fn parse_response(stdout: &[u8]) -> Result<WorkerResponse> {
    let text = String::from_utf8_lossy(stdout);
    let start = text
        .find(RESULT_START)
        .ok_or_else(|| SandboxError::Protocol("no result marker in worker output".to_string()))?;
    let body = &text[start + RESULT_START.len()..];
    let end = body
        .find(RESULT_END)
        .ok_or_else(|| SandboxError::Protocol("result marker not terminated".to_string()))?;
    let response: WorkerResponse = serde_json::from_str(body[..end].trim())?;
    Ok(response)
}

/// Python program run by every worker (`python -c`).
pub const WORKER_HARNESS: &str = r#"
import base64
import builtins
import importlib
import io
import json
import os
import sys
import warnings

RESULT_START = "__PLOTSANDBOX_RESULT_START__"
RESULT_END = "__PLOTSANDBOX_RESULT_END__"
_stdout = sys.stdout

_SAFE_BUILTINS = (
    "abs", "all", "any", "ascii", "bin", "bool", "bytearray", "bytes", "callable", "chr",
    "classmethod", "complex", "dict", "divmod", "enumerate", "filter", "float", "format",
    "frozenset", "hasattr", "hash", "hex", "id", "int", "isinstance", "issubclass", "iter",
    "len", "list", "map", "max", "min", "next", "object", "oct", "ord", "pow", "print",
    "property", "range", "repr", "reversed", "round", "set", "slice", "sorted",
    "staticmethod", "str", "sum", "super", "tuple", "type", "zip",
    "ArithmeticError", "AssertionError", "AttributeError", "Exception", "IndexError",
    "KeyError", "LookupError", "MemoryError", "NameError", "NotImplementedError",
    "OverflowError", "RuntimeError", "StopIteration", "TypeError", "ValueError",
    "ZeroDivisionError", "ImportError", "Warning", "UserWarning", "DeprecationWarning",
    "FutureWarning", "True", "False", "None", "NotImplemented", "Ellipsis",
)


def _emit(payload):
    _stdout.write("\n" + RESULT_START + "\n")
    _stdout.write(json.dumps(payload))
    _stdout.write("\n" + RESULT_END + "\n")
    _stdout.flush()


def _submission_line(exc):
    line = None
    tb = exc.__traceback__
    while tb is not None:
        if tb.tb_frame.f_code.co_filename == "<submission>":
            line = tb.tb_lineno
        tb = tb.tb_next
    if line is None and isinstance(exc, SyntaxError):
        line = exc.lineno
    return line


def _failure(status, exc, phase):
    return {
        "status": status,
        "error_type": type(exc).__name__,
        "message": str(exc)[:2000],
        "line": _submission_line(exc),
        "phase": phase,
    }


def _module_allowed(name, request):
    if name.split(".")[0] not in request["allowed_modules"]:
        return False
    for denied in request["denied_submodules"]:
        if name == denied or name.startswith(denied + "."):
            return False
    return True


def _guarded_import(request):
    real_import = builtins.__import__

    def guarded(name, globals=None, locals=None, fromlist=(), level=0):
        if level != 0 or not _module_allowed(name, request):
            raise ImportError("import of '%s' is not allowed" % name)
        for member in fromlist or ():
            if member != "*" and not _module_allowed(name + "." + member, request):
                raise ImportError("import of '%s.%s' is not allowed" % (name, member))
        return real_import(name, globals, locals, fromlist, level)

    return guarded


def _safe_builtins(request):
    table = {name: getattr(builtins, name) for name in _SAFE_BUILTINS if hasattr(builtins, name)}
    table["__import__"] = _guarded_import(request)
    table["__build_class__"] = builtins.__build_class__
    table["__name__"] = "__main__"
    return table


def _load_dataset(pd, binding):
    path, fmt = binding["path"], binding["format"]
    if fmt == "csv":
        return pd.read_csv(path)
    if fmt == "tsv":
        return pd.read_csv(path, sep="\t")
    if fmt == "json":
        try:
            return pd.read_json(path)
        except ValueError:
            return pd.read_json(path, lines=True)
    if fmt == "parquet":
        return pd.read_parquet(path)
    if fmt == "excel":
        return pd.read_excel(path)
    return pd.DataFrame()


def _bind_imports(namespace, imports):
    for entry in imports:
        module_name = entry["module"]
        module = importlib.import_module(module_name)
        member = entry.get("member")
        bind_as = entry["bind_as"]
        if bind_as == "*":
            names = getattr(module, "__all__", None) or [n for n in dir(module) if not n.startswith("_")]
            for name in names:
                if hasattr(module, name):
                    namespace[name] = getattr(module, name)
        elif member is not None:
            try:
                namespace[bind_as] = getattr(module, member)
            except AttributeError:
                namespace[bind_as] = importlib.import_module(module_name + "." + member)
        elif "." in module_name and bind_as == module_name.split(".")[0]:
            namespace[bind_as] = importlib.import_module(bind_as)
        else:
            namespace[bind_as] = module


def _setup_style(plt):
    from matplotlib import font_manager

    fonts_found = False
    for font_file in (
        "/usr/share/fonts/truetype/msttcorefonts/Times_New_Roman.ttf",
        "/usr/share/fonts/truetype/msttcorefonts/Times_New_Roman_Bold.ttf",
    ):
        if os.path.exists(font_file):
            font_manager.fontManager.addfont(font_file)
            fonts_found = True
    plt.rcParams["font.family"] = "Times New Roman" if fonts_found else "serif"
    plt.rcParams.update({
        "axes.linewidth": 1.5,
        "xtick.major.width": 1.5,
        "ytick.major.width": 1.5,
        "xtick.minor.width": 1.0,
        "ytick.minor.width": 1.0,
        "xtick.major.size": 6,
        "ytick.major.size": 6,
        "xtick.minor.size": 3,
        "ytick.minor.size": 3,
        "xtick.labelsize": 12,
        "ytick.labelsize": 12,
        "axes.labelsize": 12,
        "legend.fontsize": 12,
        "axes.titlesize": 12,
        "figure.titlesize": 12,
        "xtick.direction": "in",
        "ytick.direction": "in",
        "xtick.top": True,
        "ytick.right": True,
    })


def _style_figure(plt, fig):
    for ax in fig.axes:
        ax.minorticks_on()
        for spine in ax.spines.values():
            spine.set_visible(True)
            spine.set_linewidth(plt.rcParams.get("axes.linewidth", 1.5))
        ax.tick_params(axis="both", which="major", direction="in", length=6, width=1.5, labelsize=12)
        ax.tick_params(axis="both", which="minor", direction="in", length=3, width=1.0)
        ax.tick_params(top=True, bottom=True, left=True, right=True,
                       labeltop=False, labelbottom=True, labelleft=True, labelright=False)


def _pad_inches(plt):
    pad = plt.rcParams.get("savefig.pad_inches", 0.1)
    try:
        return float(pad)
    except (TypeError, ValueError):
        return 0.1


def _rect(x0, y0, x1, y1):
    return {"x0": float(x0), "y0": float(y0), "x1": float(x1), "y1": float(y1)}


def _measure(fig, tight, pad):
    fig.canvas.draw()
    renderer = fig.canvas.get_renderer()
    texts = []

    def add(kind, artist, axes_index):
        if artist is None or not artist.get_visible():
            return
        text = artist.get_text()
        if not text or not text.strip():
            return
        box = artist.get_window_extent(renderer)
        texts.append({
            "kind": kind,
            "text": text,
            "extent": _rect(box.x0, box.y0, box.x1, box.y1),
            "axes_index": axes_index,
        })

    add("title", getattr(fig, "_suptitle", None), None)
    for index, ax in enumerate(fig.axes):
        add("title", ax.title, index)
        add("title", getattr(ax, "_left_title", None), index)
        add("title", getattr(ax, "_right_title", None), index)
        add("x_label", ax.xaxis.label, index)
        add("y_label", ax.yaxis.label, index)
        legend = ax.get_legend()
        if legend is not None and legend.get_visible():
            for entry in legend.get_texts():
                add("legend", entry, index)
    for legend in getattr(fig, "legends", []):
        for entry in legend.get_texts():
            add("legend", entry, None)

    if tight:
        box = fig.get_tightbbox(renderer)
        dpi = fig.dpi
        canvas = _rect((box.x0 - pad) * dpi, (box.y0 - pad) * dpi,
                       (box.x1 + pad) * dpi, (box.y1 + pad) * dpi)
    else:
        canvas = _rect(0.0, 0.0, fig.bbox.width, fig.bbox.height)
    return {"canvas": canvas, "texts": texts}


def _run(request):
    try:
        import matplotlib
        matplotlib.use("Agg")
        import matplotlib.pyplot as plt
        import numpy as np
        import pandas as pd
    except BaseException as exc:
        return _failure("setup_error", exc, "setup")
    try:
        import seaborn as sns
    except ImportError:
        sns = None

    try:
        code = compile(request["code"], "<submission>", "exec")
    except SyntaxError as exc:
        return _failure("syntax_error", exc, "compile")

    if request["enforce_style"]:
        _setup_style(plt)

    namespace = {
        "__builtins__": _safe_builtins(request),
        "__name__": "__main__",
        "plt": plt,
        "np": np,
        "pd": pd,
        "sns": sns,
        "matplotlib": matplotlib,
    }

    try:
        _bind_imports(namespace, request["injected_imports"])
        frames = {}
        for binding in request["datasets"]:
            frames[binding["alias"]] = _load_dataset(pd, binding)
    except BaseException as exc:
        return _failure("runtime_error", exc, "prepare")
    namespace.update(frames)
    if frames:
        namespace["df"] = next(iter(frames.values()))
    namespace["dfs"] = dict(frames)
    namespace["dataframes"] = dict(frames)

    captured = io.StringIO()
    with warnings.catch_warnings(record=True) as caught:
        warnings.simplefilter("always")
        sys.stdout = captured
        try:
            exec(code, namespace)
        except BaseException as exc:
            return _failure("runtime_error", exc, "execute")
        finally:
            sys.stdout = _stdout

    runtime_warnings = []
    for item in caught:
        text = "%s: %s" % (item.category.__name__, item.message)
        if text not in runtime_warnings:
            runtime_warnings.append(text)

    try:
        fig = plt.gcf()
        if request["enforce_style"]:
            _style_figure(plt, fig)
        tight = request["tight_bbox"]
        pad = _pad_inches(plt)
        figure = _measure(fig, tight, pad)
        fig.savefig(
            request["artifact_path"],
            format=request["format"],
            dpi=request["dpi"],
            bbox_inches="tight" if tight else None,
            pad_inches=pad,
        )
        with open(request["artifact_path"], "rb") as handle:
            artifact = handle.read()
    except BaseException as exc:
        return _failure("runtime_error", exc, "render")

    return {
        "status": "success",
        "artifact": base64.b64encode(artifact).decode("ascii"),
        "figure": figure,
        "warnings": runtime_warnings[:20],
        "output": captured.getvalue()[:4096],
    }


def main():
    try:
        request = json.loads(sys.stdin.readline())
    except BaseException as exc:
        _emit(_failure("setup_error", exc, "request"))
        return
    try:
        payload = _run(request)
    except BaseException as exc:
        payload = _failure("setup_error", exc, "harness")
    _emit(payload)


main()
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response_ignores_noise() {
        let stdout = format!(
            "libpng warning: noise\n{RESULT_START}\n{}\n{RESULT_END}\ntrailing\n",
            r#"{"status": "runtime_error", "error_type": "ZeroDivisionError", "message": "division by zero", "line": 3}"#
        );
        let response = parse_response(stdout.as_bytes()).unwrap();
        assert_eq!(response.status, WorkerStatus::RuntimeError);
        assert_eq!(response.describe_error(), "ZeroDivisionError: division by zero (line 3)");
        assert!(!response.is_memory_error());
    }

    #[test]
    fn test_parse_response_without_marker() {
        assert!(matches!(
            parse_response(b"Segmentation fault"),
            Err(SandboxError::Protocol(_))
        ));
    }

    #[test]
    fn test_parse_truncated_response() {
        let stdout = format!("{RESULT_START}\n{{\"status\": \"succ");
        assert!(parse_response(stdout.as_bytes()).is_err());
    }

    #[test]
    fn test_request_wire_format() {
        let request = WorkerRequest {
            code: "plt.plot([1, 2])".into(),
            datasets: vec![WorkerDataset {
                alias: "df_sales".into(),
                path: PathBuf::from("/data/sales.csv"),
                format: DatasetFormat::Csv,
            }],
            injected_imports: vec![],
            allowed_modules: vec!["numpy".into()],
            denied_submodules: vec![],
            artifact_path: PathBuf::from("/ws/output/figure.png"),
            format: ImageFormat::Png,
            dpi: 300,
            tight_bbox: true,
            enforce_style: false,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["datasets"][0]["format"], "csv");
        assert_eq!(json["format"], "png");
        assert!(!serde_json::to_string(&request).unwrap().contains('\n'));
    }

    #[test]
    fn test_harness_mentions_markers() {
        assert!(WORKER_HARNESS.contains(RESULT_START));
        assert!(WORKER_HARNESS.contains(RESULT_END));
    }
}
