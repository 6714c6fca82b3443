// tests/pipeline_end_to_end.rs

//! Full pipeline runs with real external processes.

use std::error::Error;
use std::path::Path;

use pipedag::cmd::{AtomicCommand, Binding, CommandPipeline, StdoutSpec};
use pipedag::errors::PipelineError;
use pipedag::node::{Node, ERROR_LOG_NAME};
use pipedag::{Config, Pipeline};
use pipedag_test_utils::init_tracing;

type TestResult = Result<(), Box<dyn Error>>;

fn test_config(dir: &Path) -> Config {
    Config::new(dir.join("temp"), 4).unwrap()
}

#[tokio::test]
async fn two_stage_pipeline_commits_outputs() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    let first_out = dir.path().join("stage1.txt");
    let second_out = dir.path().join("stage2.txt");

    let first_cmd = AtomicCommand::build(["sh", "-c", "printf 'raw data' > {OUT}"])
        .bind("OUT", Binding::OutputFile(first_out.clone()))
        .done()?;
    let first = Node::command(CommandPipeline::single(first_cmd)?)
        .description("write raw data")
        .build()?;

    let second_cmd = AtomicCommand::build(["tr", "a-z", "A-Z"])
        .stdin(pipedag::cmd::StdinSpec::File(first_out.clone()))
        .stdout(StdoutSpec::File(second_out.clone()))
        .done()?;
    let second = Node::command(CommandPipeline::single(second_cmd)?)
        .description("uppercase")
        .dependency(first.clone())
        .build()?;

    let mut pipeline = Pipeline::new(config);
    pipeline.add_node(second);
    let summary = pipeline.run().await?;

    assert_eq!(summary.done, 2);
    assert_eq!(summary.skipped, 0);
    assert_eq!(std::fs::read_to_string(&first_out)?, "raw data");
    assert_eq!(std::fs::read_to_string(&second_out)?, "RAW DATA");
    Ok(())
}

#[tokio::test]
async fn second_run_skips_fresh_nodes() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let output = dir.path().join("once.txt");

    let build_pipeline = || -> Result<Pipeline, Box<dyn Error>> {
        let command = AtomicCommand::build(["sh", "-c", "printf 'once' > {OUT}"])
            .bind("OUT", Binding::OutputFile(output.clone()))
            .done()?;
        let node = Node::command(CommandPipeline::single(command)?)
            .description("write once")
            .build()?;
        let mut pipeline = Pipeline::new(test_config(dir.path()));
        pipeline.add_node(node);
        Ok(pipeline)
    };

    let summary = build_pipeline()?.run().await?;
    assert_eq!((summary.done, summary.skipped), (1, 0));

    let summary = build_pipeline()?.run().await?;
    assert_eq!((summary.done, summary.skipped), (0, 1));
    Ok(())
}

#[tokio::test]
async fn failed_node_preserves_temp_dir_with_diagnostics() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    let output = dir.path().join("never.txt");

    let command = AtomicCommand::build(["sh", "-c", "exit 3"])
        .bind("OUT", Binding::OutputFile(output.clone()))
        .done()?;
    let node = Node::command(CommandPipeline::single(command)?)
        .description("exits nonzero")
        .build()?;

    let mut pipeline = Pipeline::new(config);
    pipeline.add_node(node);
    let err = pipeline.run().await.unwrap_err();
    match err {
        PipelineError::NodesFailed { failed } => {
            assert_eq!(failed.len(), 1);
            assert!(failed[0].contains("exits nonzero"));
        }
        other => panic!("unexpected error: {other}"),
    }

    // The temp directory survives with the diagnostic log; no output was
    // committed.
    assert!(!output.exists());
    let temp_dirs: Vec<_> = std::fs::read_dir(dir.path().join("temp"))?
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(temp_dirs.len(), 1);
    let log = std::fs::read_to_string(temp_dirs[0].join(ERROR_LOG_NAME))?;
    assert!(log.contains("exits nonzero"));
    assert!(log.contains("return-codes: [3]"));
    Ok(())
}

#[tokio::test]
async fn failure_skips_dependents_but_not_unrelated_branches() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    let doomed_out = dir.path().join("doomed.txt");
    let downstream_out = dir.path().join("downstream.txt");
    let unrelated_out = dir.path().join("unrelated.txt");

    let doomed_cmd = AtomicCommand::build(["sh", "-c", "exit 1"])
        .bind("OUT", Binding::OutputFile(doomed_out))
        .done()?;
    let doomed = Node::command(CommandPipeline::single(doomed_cmd)?)
        .description("doomed")
        .build()?;

    let downstream_cmd = AtomicCommand::build(["sh", "-c", "printf x > {OUT}"])
        .bind("OUT", Binding::OutputFile(downstream_out.clone()))
        .done()?;
    let downstream = Node::command(CommandPipeline::single(downstream_cmd)?)
        .description("downstream")
        .dependency(doomed)
        .build()?;

    let unrelated_cmd = AtomicCommand::build(["sh", "-c", "printf y > {OUT}"])
        .bind("OUT", Binding::OutputFile(unrelated_out.clone()))
        .done()?;
    let unrelated = Node::command(CommandPipeline::single(unrelated_cmd)?)
        .description("unrelated")
        .build()?;

    let mut pipeline = Pipeline::new(config);
    pipeline.add_nodes([downstream, unrelated]);
    let err = pipeline.run().await.unwrap_err();

    match err {
        PipelineError::NodesFailed { failed } => {
            assert_eq!(failed.len(), 2);
            assert!(failed.iter().any(|entry| entry.contains("doomed")));
            assert!(failed.iter().any(|entry| entry.contains("downstream")));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!downstream_out.exists());
    assert_eq!(std::fs::read_to_string(&unrelated_out)?, "y");
    Ok(())
}

#[tokio::test]
async fn meta_stage_gates_downstream_work() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    let a_out = dir.path().join("a.txt");
    let b_out = dir.path().join("b.txt");
    let merged = dir.path().join("merged.txt");

    let make_writer = |label: &str, out: &Path| -> Result<std::sync::Arc<Node>, Box<dyn Error>> {
        let command = AtomicCommand::build(["sh", "-c", "printf part > {OUT}"])
            .bind("OUT", Binding::OutputFile(out.to_path_buf()))
            .done()?;
        Ok(Node::command(CommandPipeline::single(command)?)
            .description(label)
            .build()?)
    };
    let a = make_writer("write a", &a_out)?;
    let b = make_writer("write b", &b_out)?;
    let stage = Node::meta()
        .description("write stage")
        .subnodes([a, b])
        .build();

    let merge_cmd = AtomicCommand::build(["sh", "-c", "cat {A} {B} > {OUT}"])
        .bind("A", Binding::InputFile(a_out))
        .bind("B", Binding::InputFile(b_out))
        .bind("OUT", Binding::OutputFile(merged.clone()))
        .done()?;
    let merge = Node::command(CommandPipeline::single(merge_cmd)?)
        .description("merge parts")
        .dependency(stage)
        .build()?;

    let mut pipeline = Pipeline::new(config);
    pipeline.add_node(merge);
    let summary = pipeline.run().await?;

    assert_eq!(summary.done, 3);
    assert_eq!(std::fs::read_to_string(&merged)?, "partpart");
    Ok(())
}

#[tokio::test]
async fn piped_commands_run_as_one_node() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    let input = dir.path().join("words.txt");
    std::fs::write(&input, "cherry\napple\nbanana\n")?;
    let output = dir.path().join("sorted.txt");

    let producer = AtomicCommand::build(["cat", "{IN}"])
        .bind("IN", Binding::InputFile(input))
        .stdout(StdoutSpec::Pipe)
        .done()?;
    let consumer = AtomicCommand::build(["sort"])
        .stdin(pipedag::cmd::StdinSpec::Piped { from: 0 })
        .stdout(StdoutSpec::File(output.clone()))
        .done()?;
    let node = Node::command(CommandPipeline::new(vec![producer, consumer])?)
        .description("sort words")
        .build()?;

    let mut pipeline = Pipeline::new(config);
    pipeline.add_node(node);
    pipeline.run().await?;

    assert_eq!(
        std::fs::read_to_string(&output)?,
        "apple\nbanana\ncherry\n"
    );
    Ok(())
}
