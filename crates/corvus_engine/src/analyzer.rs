//! Automatic resource allocation from the script text.

use corvus_core::prelude::*;

use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::LazyLock;

const GPU_LIBRARIES: &[&str] = &[
    "torch",
    "tensorflow",
    "keras",
    "cupy",
    "cudf",
    "cuml",
    "pycuda",
    "numba",
    "jax",
    "mxnet",
    "paddle",
    "onnxruntime",
];

const MEMORY_LIBRARIES: &[&str] = &[
    "pandas",
    "numpy",
    "scipy",
    "sklearn",
    "xgboost",
    "lightgbm",
    "catboost",
    "dask",
    "polars",
    "vaex",
    "modin",
    "cv2",
    "PIL",
    "matplotlib",
    "seaborn",
    "plotly",
];

static IMPORTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:import|from)\s+([A-Za-z_][A-Za-z0-9_]*)").expect("valid regex")
});

static COMPUTE_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"\.fit\s*\(", "model training"),
        (r"\.train\s*\(", "training loop"),
        (r"for\s+epoch\s+in", "epoch loop"),
        (r"for\s+\w+\s+in\s+range\s*\(\s*\d{4,}", "large iteration loop"),
        (r"while\s+True", "unbounded loop"),
        (r"\.backward\s*\(", "backpropagation"),
        (r"optimizer\.step", "optimizer step"),
        (r"\.predict\s*\(", "model prediction"),
        (r"multiprocessing", "multiprocessing"),
        (r"(?:Thread|Process)PoolExecutor", "worker pool"),
    ]
    .into_iter()
    .map(|(p, d)| (Regex::new(p).expect("valid regex"), d))
    .collect()
});

static GPU_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"\.cuda\s*\(", "CUDA transfer"),
        (r#"\.to\s*\(\s*['"]cuda"#, "CUDA device transfer"),
        (r"torch\.cuda", "PyTorch CUDA"),
        (r"(?i)tf\.config.*GPU", "TensorFlow GPU config"),
        (r"CUDA_VISIBLE_DEVICES", "CUDA environment"),
        (r"@cuda\.jit", "Numba CUDA JIT"),
    ]
    .into_iter()
    .map(|(p, d)| (Regex::new(p).expect("valid regex"), d))
    .collect()
});

/// Recommended allocation for a script.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScriptAnalysis {
    pub profile: &'static str,
    pub mode: ExecutionMode,
    pub libraries: Vec<String>,
    pub gpu_indicators: Vec<String>,
    pub memory_indicators: Vec<String>,
    pub compute_indicators: Vec<String>,
    pub reasoning: String,
}

/// Scores GPU indicators 3 points, memory-heavy libraries and compute patterns 2 points each.
pub fn analyze(script: &str, gpu_available: bool) -> ScriptAnalysis {
    if script.trim().is_empty() {
        return ScriptAnalysis {
            profile: "small",
            mode: ExecutionMode::Cpu,
            libraries: Vec::new(),
            gpu_indicators: Vec::new(),
            memory_indicators: Vec::new(),
            compute_indicators: Vec::new(),
            reasoning: "Empty script, using small profile".to_string(),
        };
    }

    let libraries: BTreeSet<String> = IMPORTS
        .captures_iter(script)
        .map(|c| c[1].to_string())
        .collect();

    let mut gpu_indicators: Vec<String> = libraries
        .iter()
        .filter(|lib| GPU_LIBRARIES.contains(&lib.as_str()))
        .map(|lib| format!("library {lib}"))
        .collect();
    gpu_indicators.extend(
        GPU_PATTERNS
            .iter()
            .filter(|(re, _)| re.is_match(script))
            .map(|(_, d)| d.to_string()),
    );

    let memory_indicators: Vec<String> = libraries
        .iter()
        .filter(|lib| MEMORY_LIBRARIES.contains(&lib.as_str()))
        .cloned()
        .collect();

    let compute_indicators: Vec<String> = COMPUTE_PATTERNS
        .iter()
        .filter(|(re, _)| re.is_match(script))
        .map(|(_, d)| d.to_string())
        .collect();

    let gpu_score = gpu_indicators.len() * 3;
    let memory_score = memory_indicators.len() * 2;
    let total = gpu_score + memory_score + compute_indicators.len() * 2;

    let mut reasoning = Vec::new();
    let (mut profile, mut mode) = if gpu_score >= 3 {
        reasoning.push(format!(
            "GPU workload ({} indicators)",
            gpu_indicators.len()
        ));
        ("gpu", ExecutionMode::Gpu)
    } else if total >= 8 {
        reasoning.push("Heavy computation, using large profile".to_string());
        ("large", ExecutionMode::Cpu)
    } else if total >= 4 || memory_score >= 2 {
        reasoning.push("Moderate resource needs, using medium profile".to_string());
        ("medium", ExecutionMode::Cpu)
    } else {
        reasoning.push("Simple script, using small profile".to_string());
        ("small", ExecutionMode::Cpu)
    };

    if mode == ExecutionMode::Gpu && !gpu_available {
        profile = "large";
        mode = ExecutionMode::Cpu;
        reasoning.push("GPU not available, falling back to large CPU profile".to_string());
    }

    if !libraries.is_empty() {
        let names: Vec<&str> = libraries.iter().take(5).map(String::as_str).collect();
        let more = libraries.len().saturating_sub(5);
        let suffix = if more > 0 {
            format!(" and {more} more")
        } else {
            String::new()
        };
        reasoning.push(format!("Detected: {}{suffix}", names.join(", ")));
    }

    ScriptAnalysis {
        profile,
        mode,
        libraries: libraries.into_iter().collect(),
        gpu_indicators,
        memory_indicators,
        compute_indicators,
        reasoning: reasoning.join(". "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_script_is_small() {
        let a = analyze("print('hello')\n", true);
        assert_eq!(a.profile, "small");
        assert_eq!(a.mode, ExecutionMode::Cpu);
    }

    #[test]
    fn torch_training_wants_gpu() {
        let script = "import torch\nmodel = Net().cuda()\nfor epoch in range(10):\n    loss.backward()\n";
        let a = analyze(script, true);
        assert_eq!(a.profile, "gpu");
        assert_eq!(a.mode, ExecutionMode::Gpu);
        assert!(a.libraries.contains(&"torch".to_string()));
    }

    #[test]
    fn gpu_falls_back_when_unavailable() {
        let a = analyze("import tensorflow as tf\n", false);
        assert_eq!(a.profile, "large");
        assert_eq!(a.mode, ExecutionMode::Cpu);
        assert!(a.reasoning.contains("GPU not available"));
    }

    #[test]
    fn dataframe_work_is_medium() {
        let a = analyze("import pandas as pd\ndf = pd.read_csv('x')\n", true);
        assert_eq!(a.profile, "medium");
    }

    #[test]
    fn heavy_cpu_work_is_large() {
        let script = "import numpy\nimport sklearn\nmodel.fit(x, y)\nmodel.predict(x)\n";
        let a = analyze(script, true);
        assert_eq!(a.profile, "large");
    }
}
