use ctf::ccsds::{CcsdsVersion, TelemetryHeader};
use ctf::config::Config;
use ctf::context::ExecutionContext;
use ctf::plugins::PluginRegistry;
use ctf::scheduler::{ScriptOutcome, TestRunner};
use ctf::script::Script;
use ctf::status::{Status, StatusReporter};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

const HK_MID: u16 = 0x0880;
const EVS_LONG_MID: u16 = 0x0808;

fn write_json(dir: &Path, name: &str, value: &Value) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, serde_json::to_string_pretty(value).unwrap()).unwrap();
    path
}

fn write_dictionary(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    write_json(
        dir,
        "mids.json",
        &json!([{"target": "cpu1", "mids": [
            {"mid_name": "TO_CMD_MID", "mid_value": "0x1880"},
            {"mid_name": "TO_HK_TLM_MID", "mid_value": "0x0880"},
            {"mid_name": "CFE_EVS_LONG_EVENT_MSG_MID", "mid_value": "0x0808"}
        ]}]),
    );
    write_json(
        dir,
        "to_cmd.json",
        &json!({"cmd_mid_name": "TO_CMD_MID", "cmd_codes": [
            {"cc_name": "TO_NOOP_CC", "cc_value": 0, "cc_data_type": "TO_NoArgsCmd_t", "cc_parameters": []},
            {"cc_name": "TO_ENABLE_OUTPUT_CC", "cc_value": 2, "cc_data_type": "TO_EnableOutput_t",
             "cc_parameters": [
                {"name": "cDestIp", "data_type": "char", "array_size": 16},
                {"name": "usDestPort", "data_type": "uint16"}
             ]}
        ]}),
    );
    write_json(
        dir,
        "to_hk.json",
        &json!({"tlm_mid_name": "TO_HK_TLM_MID", "tlm_data_type": "TO_HkTlm_t",
                "tlm_parameters": [{"name": "usCmdCnt", "data_type": "uint16"}]}),
    );
    write_json(
        dir,
        "evs_packet_id.json",
        &json!({"data_type": "CFE_EVS_PacketID_t", "parameters": [
            {"name": "AppName", "data_type": "char", "array_size": 20},
            {"name": "EventID", "data_type": "uint16"}
        ]}),
    );
    write_json(
        dir,
        "evs_payload.json",
        &json!({"data_type": "CFE_EVS_LongEventTlm_Payload_t", "parameters": [
            {"name": "PacketID", "data_type": "CFE_EVS_PacketID_t"},
            {"name": "Message", "data_type": "char", "array_size": 32}
        ]}),
    );
    write_json(
        dir,
        "evs_long.json",
        &json!({"tlm_mid_name": "CFE_EVS_LONG_EVENT_MSG_MID", "tlm_data_type": "CFE_EVS_LongEventTlm_t",
                "tlm_parameters": [{"name": "Payload", "data_type": "CFE_EVS_LongEventTlm_Payload_t"}]}),
    );
}

/// A stand-in for the flight software: a UDP socket on the command port.
struct Harness {
    dir: TempDir,
    config: Arc<Config>,
    fsw: UdpSocket,
}

async fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let ccdd = dir.path().join("ccdd");
    write_dictionary(&ccdd);
    let fsw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let cmd_port = fsw.local_addr().unwrap().port();

    let toml = format!(
        r#"
[core]
ctf_verification_timeout = 1.0
ctf_verification_poll_period = 0.05
delay_between_scripts = 0.0

[cfs]
ccsds_data_dir = "{}"
ccsds_target = "cpu1"
cfs_run_dir = "."
cfs_exe = "core-cpu1"
cfs_target_ip = "127.0.0.1"
ctf_ip = "127.0.0.1"
cmd_udp_port = {}
tlm_udp_port = 0
"#,
        ccdd.display(),
        cmd_port
    );
    Harness {
        dir,
        config: Arc::new(Config::from_toml(&toml).unwrap()),
        fsw,
    }
}

impl Harness {
    fn script(&self, name: &str, tests: Value) -> PathBuf {
        write_json(
            self.dir.path(),
            name,
            &json!({
                "test_number": "CTF-1",
                "test_name": name,
                "requirements": {"CTF-REQ-1": "N/A"},
                "description": "scenario",
                "owner": "ctf",
                "tests": tests
            }),
        )
    }

    fn single_test(&self, name: &str, instructions: Value) -> PathBuf {
        self.script(
            name,
            json!([{"case_number": "CTF-1-001", "description": name, "instructions": instructions}]),
        )
    }

    async fn recv(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 2048];
        let (len, _) = timeout(Duration::from_secs(2), self.fsw.recv_from(&mut buf))
            .await
            .expect("no command datagram")
            .unwrap();
        buf.truncate(len);
        buf
    }
}

async fn run(config: &Config, registry: &mut PluginRegistry, path: &Path) -> ScriptOutcome {
    let script = Script::load(path).unwrap();
    let mut status = StatusReporter::disabled();
    let mut ctx = ExecutionContext::new();
    TestRunner::new(registry, &config.core, &mut status)
        .run_script(&script, &mut ctx)
        .await
}

fn tlm(mid: u16, payload: &[u8]) -> Vec<u8> {
    let mut bytes = TelemetryHeader::new(CcsdsVersion::V1, mid, payload.len()).encode();
    bytes.extend_from_slice(payload);
    bytes
}

fn event(app: &str, id: u16) -> Vec<u8> {
    let mut payload = vec![0u8; 20 + 2 + 32];
    payload[..app.len()].copy_from_slice(app.as_bytes());
    payload[20..22].copy_from_slice(&id.to_le_bytes());
    let msg = b"No-op command";
    payload[22..22 + msg.len()].copy_from_slice(msg);
    tlm(EVS_LONG_MID, &payload)
}

#[tokio::test]
async fn test_single_noop_sends_header_only() {
    let h = harness().await;
    let mut registry = PluginRegistry::new(Arc::clone(&h.config));
    let path = h.single_test(
        "noop.json",
        json!([{"instruction": "SendCfsCommand",
                "data": {"mid": "TO_CMD_MID", "cc": "TO_NOOP_CC", "args": {}}, "wait": 0}]),
    );

    let outcome = run(&h.config, &mut registry, &path).await;
    assert_eq!(outcome.status, Status::Passed);
    assert_eq!(outcome.num_passed(), 1);

    let datagram = h.recv().await;
    assert_eq!(datagram.len(), 8);
    assert_eq!(&datagram[..2], &[0x18, 0x80]);
    assert_eq!(datagram[6], 0);
    registry.shutdown().await;
}

#[tokio::test]
async fn test_enable_output_then_check_tlm_value() {
    let h = harness().await;
    let mut registry = PluginRegistry::new(Arc::clone(&h.config));
    let path = h.single_test(
        "tlm.json",
        json!([
            {"instruction": "EnableCfsOutput", "data": {}, "wait": 0},
            {"instruction": "CheckTlmValue",
             "data": {"mid": "TO_HK_TLM_MID", "args": [{"variable": "usCmdCnt", "compare": "==", "value": 1}]},
             "wait": 0}
        ]),
    );

    let fsw = h.fsw;
    let flight_software = tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        let (len, _) = fsw.recv_from(&mut buf).await.unwrap();
        let payload = &buf[8..len];
        let ip = String::from_utf8_lossy(&payload[..16])
            .trim_end_matches('\0')
            .to_string();
        let port = u16::from_le_bytes([payload[16], payload[17]]);
        let hk = tlm(HK_MID, &1u16.to_le_bytes());
        for _ in 0..100 {
            fsw.send_to(&hk, (ip.as_str(), port)).await.unwrap();
            sleep(Duration::from_millis(50)).await;
        }
    });

    let outcome = run(&h.config, &mut registry, &path).await;
    flight_software.abort();
    assert_eq!(outcome.status, Status::Passed);
    assert_eq!(outcome.tests[0].num_ran, 2);
    registry.shutdown().await;
}

#[tokio::test]
async fn test_function_inlining_with_wait() {
    let h = harness().await;
    let path = write_json(
        h.dir.path(),
        "functions.json",
        &json!({
            "test_number": "CTF-3",
            "test_name": "functions",
            "requirements": {},
            "description": "inline",
            "owner": "ctf",
            "functions": {
                "f": {
                    "varlist": ["x"],
                    "instructions": [
                        {"instruction": "SetUserVariable", "data": {"variable_name": "a", "operator": "=", "value": "x"}, "wait": 0},
                        {"instruction": "SetUserVariable", "data": {"variable_name": "b", "operator": "=", "value": "x"}, "wait": 0}
                    ]
                }
            },
            "tests": [{
                "case_number": "CTF-3-001",
                "description": "call f",
                "instructions": [{"function": "f", "params": {"x": 5}, "wait": 2}]
            }]
        }),
    );

    let script = Script::load(&path).unwrap();
    let instructions = &script.tests[0].instructions;
    assert_eq!(instructions.len(), 2);
    assert_eq!(instructions[0].delay, 2.0);
    assert_eq!(instructions[1].delay, 0.0);
    assert_eq!(instructions[0].data["value"], json!(5));
    assert_eq!(instructions[1].data["value"], json!(5));
    assert_eq!((instructions[0].index, instructions[1].index), (0, 1));
}

#[tokio::test]
async fn test_loop_runs_while_condition_holds() {
    let h = harness().await;
    let mut registry = PluginRegistry::new(Arc::clone(&h.config));
    let body = |start: i64, expected: i64| {
        json!([
            {"instruction": "SetUserVariable", "data": {"variable_name": "counter", "operator": "=", "value": start}},
            {"instruction": "SetUserVariable", "data": {"variable_name": "runs", "operator": "=", "value": 0}},
            {"instruction": "BeginLoop", "data": {"label": "L", "conditions": [
                {"variable": "counter", "compare": "<", "value": 3}
            ]}},
            {"instruction": "SetUserVariable", "data": {"variable_name": "counter", "operator": "+", "value": 1}},
            {"instruction": "SetUserVariable", "data": {"variable_name": "runs", "operator": "+", "value": 1}},
            {"instruction": "EndLoop", "data": {"label": "L"}},
            {"instruction": "CheckUserVariable", "data": {"variable_name": "runs", "operator": "==", "value": expected}}
        ])
    };
    let path = h.script(
        "loop.json",
        json!([
            {"case_number": "CTF-4-001", "description": "three passes", "instructions": body(0, 3)},
            {"case_number": "CTF-4-002", "description": "no passes", "instructions": body(3, 0)}
        ]),
    );

    let outcome = run(&h.config, &mut registry, &path).await;
    assert_eq!(outcome.status, Status::Passed);
    assert_eq!(outcome.num_passed(), 2);
    // 2 setup + 3 x (BeginLoop, 2 body, EndLoop) + final BeginLoop + check
    assert_eq!(outcome.tests[0].num_ran, 2 + 3 * 4 + 1 + 1);
    assert_eq!(outcome.tests[1].num_ran, 2 + 1 + 1);
}

#[tokio::test]
async fn test_raw_payload_is_sent_verbatim() {
    let h = harness().await;
    let mut registry = PluginRegistry::new(Arc::clone(&h.config));
    let path = h.single_test(
        "raw.json",
        json!([{"instruction": "SendCfsCommandWithRawPayload",
                "data": {"mid": "TO_CMD_MID", "cc": "TO_ENABLE_OUTPUT_CC", "hex": "0xABCDEF"}}]),
    );

    let outcome = run(&h.config, &mut registry, &path).await;
    assert_eq!(outcome.status, Status::Passed);
    let datagram = h.recv().await;
    assert_eq!(datagram.len(), 8 + 3);
    assert_eq!(datagram[6], 2);
    assert_eq!(&datagram[8..], &[0xAB, 0xCD, 0xEF]);
    registry.shutdown().await;
}

#[tokio::test]
async fn test_negative_and_positive_event_checks() {
    let h = harness().await;
    let mut registry = PluginRegistry::new(Arc::clone(&h.config));
    let no_event = h.single_test(
        "no_event.json",
        json!([{"instruction": "CheckNoEvent", "data": {"app": "TO", "id": 3}, "timeout": 0.2}]),
    );

    let outcome = run(&h.config, &mut registry, &no_event).await;
    assert_eq!(outcome.status, Status::Passed);

    let port = registry
        .cfs()
        .target("cfs")
        .expect("target registered implicitly")
        .telemetry()
        .port();
    let fsw = h.fsw;
    let flight_software = tokio::spawn(async move {
        let packet = event("TO", 3);
        for _ in 0..60 {
            fsw.send_to(&packet, ("127.0.0.1", port)).await.unwrap();
            sleep(Duration::from_millis(50)).await;
        }
    });

    let check = write_json(
        h.dir.path(),
        "event.json",
        &json!({
            "test_number": "CTF-6",
            "test_name": "event",
            "requirements": {},
            "description": "events",
            "owner": "ctf",
            "tests": [
                {"case_number": "CTF-6-001", "description": "event seen",
                 "instructions": [{"instruction": "CheckEvent", "data": {"app": "TO", "id": 3}, "wait": 0.2}]},
                {"case_number": "CTF-6-002", "description": "event not expected",
                 "instructions": [{"instruction": "CheckNoEvent", "data": {"app": "TO", "id": 3}, "timeout": 0.2}]}
            ]
        }),
    );
    let outcome = run(&h.config, &mut registry, &check).await;
    flight_software.abort();
    assert_eq!(outcome.tests[0].status, Status::Passed);
    assert_eq!(outcome.tests[1].status, Status::Failed);
    assert_eq!(outcome.status, Status::Failed);
    registry.shutdown().await;
}

#[tokio::test]
async fn test_earlier_failure_does_not_abort_on_later_pass() {
    let h = harness().await;
    let mut registry = PluginRegistry::new(Arc::clone(&h.config));
    let path = h.single_test(
        "end_on_fail.json",
        json!([
            {"instruction": "CheckUserVariable", "data": {"variable_name": "x", "operator": "==", "value": 1}},
            {"instruction": "RegisterCfs", "data": {"target": ""}},
            {"instruction": "SetUserVariable", "data": {"variable_name": "after", "operator": "=", "value": 1}}
        ]),
    );

    let outcome = run(&h.config, &mut registry, &path).await;
    assert_eq!(outcome.tests[0].status, Status::Failed);
    assert_eq!(outcome.tests[0].num_ran, 3);
    registry.shutdown().await;
}

#[tokio::test]
async fn test_zero_timeout_check_ignores_stale_packets() {
    let h = harness().await;
    let mut registry = PluginRegistry::new(Arc::clone(&h.config));
    let register = h.single_test(
        "register.json",
        json!([{"instruction": "RegisterCfs", "data": {"target": ""}}]),
    );
    assert_eq!(run(&h.config, &mut registry, &register).await.status, Status::Passed);

    let port = registry.cfs().target("cfs").unwrap().telemetry().port();
    h.fsw
        .send_to(&tlm(HK_MID, &1u16.to_le_bytes()), ("127.0.0.1", port))
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    let check = json!({"mid": "TO_HK_TLM_MID", "args": [{"variable": "usCmdCnt", "compare": "==", "value": 1}]});
    let path = h.script(
        "stale.json",
        json!([
            {"case_number": "CTF-7-001", "description": "stale packet", "instructions": [
                {"instruction": "SetUserVariable", "data": {"variable_name": "x", "operator": "=", "value": 1}, "wait": 0.3},
                {"instruction": "CheckTlmValue", "data": check.clone(), "wait": 0.1, "timeout": 0}
            ]},
            {"case_number": "CTF-7-002", "description": "no fresh packet", "instructions": [
                {"instruction": "CheckNoTlmPacket", "data": check, "timeout": 0}
            ]}
        ]),
    );

    let outcome = run(&h.config, &mut registry, &path).await;
    assert_eq!(outcome.tests[0].status, Status::Failed);
    assert_eq!(outcome.tests[1].status, Status::Passed);
    registry.shutdown().await;
}
