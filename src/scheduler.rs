//! Instruction scheduler: runs the tests of a script one instruction at a time.
//!
//! Control-flow labels are resolved by [`preflight`] before a test starts. Instructions run
//! strictly in sequence; verification instructions are polled once per poll period until they
//! pass or their timeout runs out.

use std::collections::HashSet;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::CoreConfig;
use crate::context::{ConditionalBranch, ExecutionContext, LabelMaps, LoopLabel, VerificationStage};
use crate::error::{ConditionError, PreflightError, TestError};
use crate::plugins::PluginRegistry;
use crate::script::{Instruction, Script, TestCase};
use crate::status::{Status, StatusReporter};
use crate::time::TimeManager;

fn label_of(instruction: &Instruction) -> Result<String, PreflightError> {
    instruction
        .data
        .get("label")
        .and_then(|label| label.as_str())
        .map(str::to_string)
        .ok_or_else(|| PreflightError::MissingLabel {
            instruction: instruction.kind.clone(),
            index: instruction.index,
        })
}

fn unmatched(instruction: &str, label: String, index: usize, expected: &'static str) -> PreflightError {
    PreflightError::Unmatched {
        instruction: instruction.to_string(),
        label,
        index,
        expected,
    }
}

/// Resolve every label of a test.
///
/// Loops and conditionals pair in LIFO order; a label may be defined once per map.
pub fn preflight(instructions: &[Instruction]) -> Result<LabelMaps, PreflightError> {
    let mut maps = LabelMaps::default();
    let mut loops: Vec<(String, usize)> = Vec::new();
    let mut branches: Vec<(String, usize, Option<usize>)> = Vec::new();
    let mut gotos = Vec::new();

    for (index, instruction) in instructions.iter().enumerate() {
        let kind = instruction.kind.as_str();
        match kind {
            "SetLabel" => {
                let label = label_of(instruction)?;
                if maps.goto.insert(label.clone(), index).is_some() {
                    return Err(PreflightError::DuplicateLabel {
                        label,
                        instruction: kind.to_string(),
                    });
                }
            }
            "Goto" => gotos.push(label_of(instruction)?),
            "BeginLoop" => {
                let label = label_of(instruction)?;
                if maps.loops.contains_key(&label) || loops.iter().any(|(open, _)| *open == label) {
                    return Err(PreflightError::DuplicateLabel {
                        label,
                        instruction: kind.to_string(),
                    });
                }
                loops.push((label, index));
            }
            "EndLoop" => {
                let label = label_of(instruction)?;
                match loops.pop() {
                    Some((open, begin)) if open == label => {
                        maps.loops.insert(
                            label,
                            LoopLabel {
                                begin,
                                end: index,
                                condition: false,
                            },
                        );
                    }
                    _ => return Err(unmatched(kind, label, index, "BeginLoop")),
                }
            }
            "IfCondition" => {
                let label = label_of(instruction)?;
                if maps.conditions.contains_key(&label)
                    || branches.iter().any(|(open, _, _)| *open == label)
                {
                    return Err(PreflightError::DuplicateLabel {
                        label,
                        instruction: kind.to_string(),
                    });
                }
                branches.push((label, index, None));
            }
            "ElseCondition" => {
                let label = label_of(instruction)?;
                match branches.last_mut() {
                    Some((open, _, else_index)) if *open == label && else_index.is_none() => {
                        *else_index = Some(index);
                    }
                    _ => return Err(unmatched(kind, label, index, "IfCondition")),
                }
            }
            "EndCondition" => {
                let label = label_of(instruction)?;
                match branches.pop() {
                    Some((open, if_index, else_index)) if open == label => {
                        maps.conditions.insert(
                            label,
                            ConditionalBranch {
                                if_index,
                                else_index,
                                end_index: index,
                                condition: false,
                            },
                        );
                    }
                    _ => return Err(unmatched(kind, label, index, "IfCondition")),
                }
            }
            _ => {}
        }
    }

    if let Some((label, index)) = loops.pop() {
        return Err(unmatched("BeginLoop", label, index, "EndLoop"));
    }
    if let Some((label, index, _)) = branches.pop() {
        return Err(unmatched("IfCondition", label, index, "EndCondition"));
    }
    if let Some(label) = gotos.into_iter().find(|label| !maps.goto.contains_key(label)) {
        return Err(PreflightError::UndefinedLabel(label));
    }
    Ok(maps)
}

/// Index of the next instruction after `index`, following a pending jump. A jump may land one
/// past the last instruction to end the test; anything further is invalid.
fn next_index(index: usize, goto: Option<usize>, len: usize) -> Option<usize> {
    match goto {
        Some(goto) if goto <= len => {
            debug!("Jumping from instruction {} to {}", index, goto);
            Some(goto)
        }
        Some(goto) => {
            error!(
                "Invalid goto instruction index {} (test has {} instructions). Aborting test...",
                goto, len
            );
            None
        }
        None => Some(index + 1),
    }
}

/// Result of one test case.
#[derive(Debug, Clone, Serialize)]
pub struct TestOutcome {
    pub case_number: String,
    pub description: String,
    pub status: Status,
    pub num_instructions: usize,
    pub num_ran: usize,
    pub num_skipped: usize,
}

impl TestOutcome {
    fn new(test: &TestCase) -> Self {
        Self {
            case_number: test.case_number.clone(),
            description: test.description.clone(),
            status: Status::Waiting,
            num_instructions: test.instructions.len(),
            num_ran: 0,
            num_skipped: 0,
        }
    }

    pub fn passed(&self) -> bool {
        self.status.is_passed()
    }
}

/// Result of one script.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptOutcome {
    pub script: String,
    pub verification_number: String,
    pub requirements: Vec<String>,
    pub status: Status,
    pub elapsed: f64,
    pub tests: Vec<TestOutcome>,
}

impl ScriptOutcome {
    pub fn new(script: &Script) -> Self {
        Self {
            script: script.file_name(),
            verification_number: script.metadata.number.clone(),
            requirements: script.metadata.requirements.clone(),
            status: Status::Waiting,
            elapsed: 0.0,
            tests: Vec::new(),
        }
    }

    /// A script that could not be loaded.
    pub fn error(script: String) -> Self {
        Self {
            script,
            verification_number: String::new(),
            requirements: Vec::new(),
            status: Status::Error,
            elapsed: 0.0,
            tests: Vec::new(),
        }
    }

    pub fn num_run(&self) -> usize {
        self.tests.len()
    }

    pub fn num_passed(&self) -> usize {
        self.tests.iter().filter(|test| test.passed()).count()
    }

    pub fn num_failed(&self) -> usize {
        self.tests
            .iter()
            .filter(|test| matches!(test.status, Status::Failed | Status::Aborted))
            .count()
    }

    pub fn num_error(&self) -> usize {
        self.tests.iter().filter(|test| test.status == Status::Error).count()
    }

    pub fn passed(&self) -> bool {
        self.status.is_passed()
    }
}

/// Runs scripts against the plugins of a registry.
pub struct TestRunner<'a> {
    registry: &'a mut PluginRegistry,
    core: &'a CoreConfig,
    status: &'a mut StatusReporter,
    time: TimeManager,
    window_open: bool,
}

impl<'a> TestRunner<'a> {
    pub fn new(
        registry: &'a mut PluginRegistry,
        core: &'a CoreConfig,
        status: &'a mut StatusReporter,
    ) -> Self {
        Self {
            registry,
            core,
            status,
            time: TimeManager::new(core.ctf_verification_poll_period),
            window_open: false,
        }
    }

    fn log_header(script: &Script) {
        let metadata = &script.metadata;
        info!("Test Script Name:            {}", metadata.name);
        info!("Test Script Number:          {}", metadata.number);
        info!("Test Conductor:              {}", metadata.owner);
        info!(
            "Test Date:                   {}",
            chrono::Local::now().format("%m/%d/%Y %H:%M:%S")
        );
        info!("Platform:                    {}", std::env::consts::OS);
        info!("Requirements Verified:       {}", metadata.requirements.join(", "));
        info!("Description:                 {}", metadata.description);
        info!("Test Input File:             {}", script.path.display());
    }

    /// Run every test of `script`. Variables start empty and persist across its tests.
    pub async fn run_script(&mut self, script: &Script, ctx: &mut ExecutionContext) -> ScriptOutcome {
        let started = Instant::now();
        let mut outcome = ScriptOutcome::new(script);
        Self::log_header(script);

        if !script.valid {
            error!("Script {} is invalid. No tests were run.", script.file_name());
            outcome.status = Status::Error;
            return outcome;
        }

        ctx.variables.clear();
        for (index, test) in script.tests.iter().enumerate() {
            let result = self.run_test(index, test, script.verify_timeout, ctx).await;
            outcome.tests.push(result);
        }

        outcome.status = if outcome.tests.iter().any(|test| test.status == Status::Error) {
            Status::Error
        } else if outcome.tests.iter().all(TestOutcome::passed) {
            Status::Passed
        } else {
            Status::Failed
        };
        outcome.elapsed = started.elapsed().as_secs_f64();

        Self::log_header(script);
        info!("Test Script Status:          {}", outcome.status);
        info!("Tests Run:                   {}", outcome.num_run());
        info!("Tests Passed:                {}", outcome.num_passed());
        info!("Tests Failed:                {}", outcome.num_failed());
        info!("Tests Error:                 {}", outcome.num_error());
        outcome
    }

    fn verify_timeout(&self, instruction: &Instruction, script_timeout: Option<f64>) -> f64 {
        instruction
            .timeout
            .or_else(|| instruction.data.get("verify_timeout").and_then(serde_json::Value::as_f64))
            .or(script_timeout)
            .unwrap_or(self.core.ctf_verification_timeout)
            .max(0.0)
    }

    fn record(&mut self, test_index: usize, instruction: &Instruction, passed: bool, label: &str) {
        let status = Status::from_result(passed);
        self.status
            .instruction(test_index, instruction.index, status, label);
        if passed {
            info!("[PASS] {} {}: {}", label, instruction.kind, instruction.data);
        } else {
            error!("[FAIL] {} {}: {}", label, instruction.kind, instruction.data);
        }
    }

    /// Run one test case.
    pub async fn run_test(
        &mut self,
        test_index: usize,
        test: &TestCase,
        script_timeout: Option<f64>,
        ctx: &mut ExecutionContext,
    ) -> TestOutcome {
        let mut outcome = TestOutcome::new(test);
        self.status.test(test_index, Status::Active);
        info!("Test {}: Starting", test.case_number);
        info!("{}", test.description);

        let instructions = &test.instructions;
        let finish = |status: &mut StatusReporter, mut outcome: TestOutcome, result: Status| {
            outcome.status = result;
            status.test(test_index, result);
            info!("Test {}: {}", outcome.case_number, outcome.status);
            info!("Number instructions To Run:         {}", outcome.num_instructions);
            info!("Number instructions Ran:            {}", outcome.num_ran);
            info!("Number instructions Skipped:        {}", outcome.num_skipped);
            outcome
        };

        if instructions.is_empty() {
            error!("Invalid Test Case: {}. Check that the script has been parsed correctly.", test.case_number);
            return finish(&mut *self.status, outcome, Status::Failed);
        }
        let labels = match preflight(instructions) {
            Ok(labels) => labels,
            Err(e) => {
                error!("Test {}: invalid control flow: {}", test.case_number, e);
                return finish(&mut *self.status, outcome, Status::Error);
            }
        };
        ctx.begin_test(labels);
        self.window_open = false;

        let ignored: HashSet<&str> = self
            .core
            .ignored_instructions
            .iter()
            .map(String::as_str)
            .collect();

        let mut test_result = true;
        let mut aborted = false;
        let mut index = 0;

        while index < instructions.len() {
            let instruction = &instructions[index];
            ctx.current_index = index;

            if instruction.disabled {
                info!("Skipping disabled test instruction {}", instruction.kind);
                self.status
                    .instruction(test_index, instruction.index, Status::Disabled, "Instruction is disabled. Skipping...");
                outcome.num_skipped += 1;
                index += 1;
                continue;
            }
            if ignored.contains(instruction.kind.as_str()) {
                info!("Ignoring test instruction {}", instruction.kind);
                self.status
                    .instruction(test_index, instruction.index, Status::Skipped, "Ignored");
                outcome.num_skipped += 1;
                index += 1;
                continue;
            }

            outcome.num_ran += 1;
            self.status
                .instruction(test_index, instruction.index, Status::Active, "");
            info!(
                "Waiting {} time-units before executing {}",
                instruction.delay, instruction.kind
            );
            if let Err(e) = self.prepare(instruction.delay, ctx).await {
                error!("[FAIL] Condition not satisfied: {}", e);
                test_result = false;
                aborted = true;
                break;
            }

            let result = if self.registry.is_verify_required(&instruction.kind) {
                let timeout = self.verify_timeout(instruction, script_timeout);
                let new_window = instruction.delay != 0.0 || !self.window_open;
                self.verify(test_index, instruction, timeout, new_window, ctx)
                    .await
            } else {
                self.execute(test_index, instruction, ctx).await
            };
            let passed = match result {
                Ok(passed) => passed,
                Err(e) => {
                    error!("[FAIL] Condition not satisfied: {}", e);
                    test_result = false;
                    aborted = true;
                    break;
                }
            };

            {
                let time = self.time;
                if let Err(e) = time.post_command(ctx, &mut *self.registry).await {
                    error!("[FAIL] Condition not satisfied: {}", e);
                    test_result = false;
                    aborted = true;
                    break;
                }
            }

            test_result &= passed;
            if !passed
                && (self.registry.ends_test_on_fail(&instruction.kind) || self.core.end_test_on_fail)
            {
                error!("Instruction: {} Failed. Aborting test...", instruction.kind);
                if self.core.end_test_on_fail {
                    warn!("Configuration field \"end_test_on_fail\" enabled. Ending testing.");
                }
                error!("Test Case: {} Failed.", test.case_number);
                aborted = true;
                break;
            }

            match next_index(index, ctx.goto_index.take(), instructions.len()) {
                Some(next) => index = next,
                None => {
                    test_result = false;
                    aborted = true;
                    break;
                }
            }
        }
        ctx.stage = VerificationStage::None;

        let status = if aborted {
            Status::Aborted
        } else {
            Status::from_result(test_result)
        };
        finish(&mut *self.status, outcome, status)
    }

    /// Wait out an instruction's delay, then drain telemetry and sweep continuous checks.
    async fn prepare(&mut self, delay: f64, ctx: &mut ExecutionContext) -> Result<(), ConditionError> {
        let time = self.time;
        time.wait(delay, ctx, &mut *self.registry).await?;
        time.pre_command(ctx, &mut *self.registry).await
    }

    async fn execute(
        &mut self,
        test_index: usize,
        instruction: &Instruction,
        ctx: &mut ExecutionContext,
    ) -> Result<bool, ConditionError> {
        let passed = match self
            .registry
            .execute(&instruction.kind, &instruction.data, ctx)
            .await
        {
            Ok(passed) => passed,
            Err(TestError::Condition(e)) => return Err(e),
            Err(e) => {
                error!("{}", e);
                false
            }
        };
        self.record(test_index, instruction, passed, "Instruction");
        Ok(passed)
    }

    /// Poll a verification until it passes or `timeout` seconds of execution time elapse.
    ///
    /// The first poll runs at `first_ver`, the final one at `last_ver`. A single poll (zero
    /// timeout) runs at `last_ver` so negative checks can still pass.
    async fn verify(
        &mut self,
        test_index: usize,
        instruction: &Instruction,
        timeout: f64,
        new_window: bool,
        ctx: &mut ExecutionContext,
    ) -> Result<bool, ConditionError> {
        if new_window {
            ctx.verification_start_time = ctx.exec_time;
            self.window_open = true;
            debug!("Setting Verification Start Time = {}", ctx.verification_start_time);
        }
        info!(
            "Waiting up to {} time-units for verification of {}: {}",
            timeout, instruction.kind, instruction.data
        );

        let time = self.time;
        let num_verify = (timeout / time.poll_period()) as usize + 1;
        let mut verified = false;
        let mut failure = None;
        for attempt in 0..num_verify {
            let last = attempt + 1 == num_verify;
            ctx.first_poll = attempt == 0;
            ctx.stage = if last {
                VerificationStage::LastVer
            } else if attempt == 0 {
                VerificationStage::FirstVer
            } else {
                VerificationStage::Polling
            };

            match self
                .registry
                .execute(&instruction.kind, &instruction.data, ctx)
                .await
            {
                Ok(true) => {
                    verified = true;
                    break;
                }
                Ok(false) => {}
                Err(TestError::Condition(e)) => {
                    failure = Some(e);
                    break;
                }
                Err(e) => {
                    error!("{}", e);
                    break;
                }
            }
            if !last {
                if let Err(e) = time.wait(time.poll_period(), ctx, &mut *self.registry).await {
                    failure = Some(e);
                    break;
                }
            }
        }
        ctx.stage = VerificationStage::None;
        ctx.first_poll = false;

        if let Some(e) = failure {
            return Err(e);
        }
        let label = if verified {
            "Verification Passed"
        } else {
            "Verification Failed"
        };
        self.record(test_index, instruction, verified, label);
        Ok(verified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::json;
    use std::sync::Arc;

    fn instructions(kinds: &[(&str, &str)]) -> Vec<Instruction> {
        kinds
            .iter()
            .enumerate()
            .map(|(index, (kind, label))| {
                let mut instruction = Instruction::new(*kind, json!({ "label": label }));
                instruction.index = index;
                instruction
            })
            .collect()
    }

    fn test_case(instructions: Vec<Instruction>) -> TestCase {
        TestCase {
            case_number: "1".into(),
            description: "unit".into(),
            instructions,
        }
    }

    fn core() -> CoreConfig {
        let mut config = Config::default();
        config.core.ctf_verification_poll_period = 0.01;
        config.core.ctf_verification_timeout = 0.05;
        config.core
    }

    #[test]
    fn test_preflight_builds_label_maps() {
        let maps = preflight(&instructions(&[
            ("SetLabel", "top"),
            ("BeginLoop", "outer"),
            ("BeginLoop", "inner"),
            ("EndLoop", "inner"),
            ("EndLoop", "outer"),
            ("IfCondition", "c"),
            ("ElseCondition", "c"),
            ("EndCondition", "c"),
            ("Goto", "top"),
        ]))
        .unwrap();
        assert_eq!(maps.goto["top"], 0);
        assert_eq!((maps.loops["outer"].begin, maps.loops["outer"].end), (1, 4));
        assert_eq!((maps.loops["inner"].begin, maps.loops["inner"].end), (2, 3));
        assert_eq!(maps.conditions["c"].else_index, Some(6));
        assert_eq!(maps.conditions["c"].end_index, 7);
    }

    #[test]
    fn test_preflight_rejects_bad_structure() {
        assert!(matches!(
            preflight(&instructions(&[("SetLabel", "a"), ("SetLabel", "a")])),
            Err(PreflightError::DuplicateLabel { .. })
        ));
        assert!(matches!(
            preflight(&instructions(&[("BeginLoop", "a"), ("BeginLoop", "b"), ("EndLoop", "a"), ("EndLoop", "b")])),
            Err(PreflightError::Unmatched { .. })
        ));
        assert!(matches!(
            preflight(&instructions(&[("EndLoop", "a")])),
            Err(PreflightError::Unmatched { .. })
        ));
        assert!(matches!(
            preflight(&instructions(&[("IfCondition", "c")])),
            Err(PreflightError::Unmatched { .. })
        ));
        assert!(matches!(
            preflight(&instructions(&[("Goto", "nowhere")])),
            Err(PreflightError::UndefinedLabel(_))
        ));
        let missing = vec![Instruction::new("SetLabel", json!({}))];
        assert!(matches!(preflight(&missing), Err(PreflightError::MissingLabel { .. })));
    }

    #[tokio::test]
    async fn test_loop_runs_body_until_condition_fails() {
        let core = core();
        let mut registry = PluginRegistry::new(Arc::new(Config::default()));
        let mut status = StatusReporter::disabled();
        let mut ctx = ExecutionContext::new();
        ctx.variables.set("counter", "=", &json!(0));
        ctx.variables.set("runs", "=", &json!(0));

        let mut body = vec![
            Instruction::new(
                "BeginLoop",
                json!({"label": "L", "conditions": [{"variable": "counter", "compare": "<", "value": 3}]}),
            ),
            Instruction::new(
                "SetUserVariable",
                json!({"variable_name": "counter", "operator": "+", "value": 1}),
            ),
            Instruction::new(
                "SetUserVariable",
                json!({"variable_name": "runs", "operator": "+", "value": 1}),
            ),
            Instruction::new("EndLoop", json!({"label": "L"})),
        ];
        for (index, instruction) in body.iter_mut().enumerate() {
            instruction.index = index;
        }
        let test = test_case(body);

        let mut runner = TestRunner::new(&mut registry, &core, &mut status);
        let outcome = runner.run_test(0, &test, None, &mut ctx).await;
        assert!(outcome.passed());
        assert_eq!(ctx.variables.get("runs"), Some(&json!(3)));

        ctx.variables.set("runs", "=", &json!(0));
        let outcome = runner.run_test(0, &test, None, &mut ctx).await;
        assert!(outcome.passed());
        assert_eq!(ctx.variables.get("runs"), Some(&json!(0)));
        assert_eq!(outcome.num_ran, 1);
    }

    #[tokio::test]
    async fn test_disabled_and_ignored_instructions_are_skipped() {
        let mut core = core();
        core.ignored_instructions = vec!["GetUserVariable".into()];
        let mut registry = PluginRegistry::new(Arc::new(Config::default()));
        let mut status = StatusReporter::disabled();
        let mut ctx = ExecutionContext::new();

        let mut disabled = Instruction::new("SetUserVariable", json!({"variable_name": "x", "operator": "=", "value": 1}));
        disabled.disabled = true;
        let test = test_case(vec![
            disabled,
            Instruction::new("GetUserVariable", json!({"variable_name": "missing"})),
            Instruction::new("SetUserVariable", json!({"variable_name": "y", "operator": "=", "value": 2})),
        ]);
        let mut runner = TestRunner::new(&mut registry, &core, &mut status);
        let outcome = runner.run_test(0, &test, None, &mut ctx).await;
        assert!(outcome.passed());
        assert_eq!(outcome.num_skipped, 2);
        assert_eq!(outcome.num_ran, 1);
        assert!(ctx.variables.get("x").is_none());
    }

    #[tokio::test]
    async fn test_failures_and_end_test_on_fail() {
        let mut core = core();
        let mut registry = PluginRegistry::new(Arc::new(Config::default()));
        let mut status = StatusReporter::disabled();
        let mut ctx = ExecutionContext::new();
        let test = test_case(vec![
            Instruction::new("CheckUserVariable", json!({"variable_name": "x", "operator": "==", "value": 1})),
            Instruction::new("SetUserVariable", json!({"variable_name": "after", "operator": "=", "value": 1})),
        ]);

        let outcome = TestRunner::new(&mut registry, &core, &mut status)
            .run_test(0, &test, None, &mut ctx)
            .await;
        assert_eq!(outcome.status, Status::Failed);
        assert_eq!(outcome.num_ran, 2);

        core.end_test_on_fail = true;
        ctx.variables.clear();
        let outcome = TestRunner::new(&mut registry, &core, &mut status)
            .run_test(0, &test, None, &mut ctx)
            .await;
        assert_eq!(outcome.status, Status::Aborted);
        assert_eq!(outcome.num_ran, 1);
        assert!(ctx.variables.get("after").is_none());
    }

    #[tokio::test]
    async fn test_unknown_instruction_fails_test() {
        let core = core();
        let mut registry = PluginRegistry::new(Arc::new(Config::default()));
        let mut status = StatusReporter::disabled();
        let mut ctx = ExecutionContext::new();
        let test = test_case(vec![Instruction::new("Nope", json!({}))]);
        let outcome = TestRunner::new(&mut registry, &core, &mut status)
            .run_test(0, &test, None, &mut ctx)
            .await;
        assert_eq!(outcome.status, Status::Failed);
    }

    #[tokio::test]
    async fn test_invalid_control_flow_is_an_error() {
        let core = core();
        let mut registry = PluginRegistry::new(Arc::new(Config::default()));
        let mut status = StatusReporter::disabled();
        let mut ctx = ExecutionContext::new();
        let test = test_case(instructions(&[("BeginLoop", "L")]));
        let outcome = TestRunner::new(&mut registry, &core, &mut status)
            .run_test(0, &test, None, &mut ctx)
            .await;
        assert_eq!(outcome.status, Status::Error);
        assert_eq!(outcome.num_ran, 0);
    }

    #[test]
    fn test_verify_timeout_precedence() {
        let core = core();
        let mut registry = PluginRegistry::new(Arc::new(Config::default()));
        let mut status = StatusReporter::disabled();
        let runner = TestRunner::new(&mut registry, &core, &mut status);

        let mut instruction = Instruction::new("CheckEvent", json!({"verify_timeout": 2.0}));
        assert_eq!(runner.verify_timeout(&instruction, Some(3.0)), 2.0);
        instruction.timeout = Some(1.0);
        assert_eq!(runner.verify_timeout(&instruction, Some(3.0)), 1.0);
        let plain = Instruction::new("CheckEvent", json!({}));
        assert_eq!(runner.verify_timeout(&plain, Some(3.0)), 3.0);
        assert_eq!(runner.verify_timeout(&plain, None), 0.05);
    }

    #[test]
    fn test_next_index_follows_jumps() {
        assert_eq!(next_index(1, None, 4), Some(2));
        assert_eq!(next_index(3, Some(0), 4), Some(0));
        assert_eq!(next_index(2, Some(4), 4), Some(4));
        assert_eq!(next_index(2, Some(5), 4), None);
    }
}
