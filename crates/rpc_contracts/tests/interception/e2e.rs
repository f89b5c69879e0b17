#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use rpc_contracts::{
    full_method_name, CallContext, CallHistory, ClientInterceptor, Condition, ConditionKind,
    ContractError, ServerContract, ServerInterceptor, ServiceContract, UnaryContract,
    ViolationReport, ViolationSink,
};
use tonic::{Code, Request, Response, Status};

const NOTE_STORE: &str = "noteservice.NoteStore";
const AUTH_SERVICE: &str = "noteservice.AuthService";

#[derive(Debug, Clone, Default, PartialEq)]
struct GetNoteRequest {
    note_id: i32,
    token: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Note {
    note_id: i32,
    text: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct AuthenticateRequest {
    token: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct AuthenticateResponse {
    user_id: i32,
}

#[derive(Debug, Clone, PartialEq)]
struct Logged {
    kind: ConditionKind,
    full_method: String,
    violation: String,
    request: String,
    handler_error: Option<Code>,
}

fn capture_sink() -> (ViolationSink, Arc<Mutex<Vec<Logged>>>) {
    let logged: Arc<Mutex<Vec<Logged>>> = Arc::default();
    let store = Arc::clone(&logged);
    let sink: ViolationSink = Arc::new(move |report: &ViolationReport<'_>| {
        store.lock().unwrap().push(Logged {
            kind: report.kind,
            full_method: report.full_method.to_string(),
            violation: report.violation.to_string(),
            request: format!("{:?}", report.request),
            handler_error: report.handler_error.map(Status::code),
        });
    });
    (sink, logged)
}

fn get_note_contract() -> ServiceContract {
    ServiceContract::new(NOTE_STORE).rpc(
        UnaryContract::new("GetNote")
            .precondition(Condition::pre(|req: &GetNoteRequest| {
                if req.note_id < 0 {
                    return Err("NoteId must be positive".into());
                }
                Ok(())
            }))
            .postcondition(Condition::post(
                |_resp: &Note, _err: Option<&Status>, _req: &GetNoteRequest, calls: &CallHistory| {
                    if calls
                        .filter(AUTH_SERVICE, "Authenticate")
                        .successful()
                        .is_empty()
                    {
                        return Err("no successful call to auth service".into());
                    }
                    Ok(())
                },
            )),
    )
}

struct Harness {
    contract: ServerContract,
    server: ServerInterceptor,
    client: ClientInterceptor,
}

fn harness(sink: ViolationSink) -> Harness {
    let contract = ServerContract::new(sink);
    contract
        .register_service_contract(get_note_contract())
        .unwrap();
    let server = contract.server_interceptor();
    let client = contract.client_interceptor();
    Harness {
        contract,
        server,
        client,
    }
}

async fn authenticate(
    client: &ClientInterceptor,
    ctx: &CallContext,
    token: &str,
) -> Result<i32, Status> {
    let method = full_method_name(AUTH_SERVICE, "Authenticate");
    let request = ctx.outbound(AuthenticateRequest {
        token: token.to_string(),
    });
    let response = client
        .call(request, &method, |req| async move {
            if req.get_ref().token == "some-token-0" {
                Ok(Response::new(AuthenticateResponse { user_id: 0 }))
            } else {
                Err(Status::unauthenticated("invalid token"))
            }
        })
        .await?;
    Ok(response.into_inner().user_id)
}

async fn get_note(
    h: &Harness,
    request: GetNoteRequest,
    call_auth: bool,
) -> Result<Response<Note>, Status> {
    let method = full_method_name(NOTE_STORE, "GetNote");
    let client = h.client.clone();
    h.server
        .intercept(Request::new(request), &method, |req| async move {
            let ctx = CallContext::from_request(&req);
            let req = req.into_inner();
            if call_auth {
                authenticate(&client, &ctx, &req.token)
                    .await
                    .map_err(|_| Status::unauthenticated("authentication failed"))?;
            }
            if req.note_id == 1 {
                return Ok(Response::new(Note {
                    note_id: 1,
                    text: "very important note".to_string(),
                }));
            }
            Err(Status::not_found(format!("no note with ID {}", req.note_id)))
        })
        .await
}

#[tokio::test]
async fn at_e2e_01_negative_id_without_auth_logs_both_violations() {
    let (sink, logged) = capture_sink();
    let h = harness(sink);

    let status = get_note(
        &h,
        GetNoteRequest {
            note_id: -1,
            token: String::new(),
        },
        false,
    )
    .await
    .expect_err("handler error must reach the caller");
    assert_eq!(status.code(), Code::NotFound);
    assert_eq!(status.message(), "no note with ID -1");

    let logged = logged.lock().unwrap();
    assert_eq!(logged.len(), 2);
    assert_eq!(logged[0].kind, ConditionKind::Pre);
    assert_eq!(logged[0].full_method, "/noteservice.NoteStore/GetNote");
    assert_eq!(logged[0].violation, "NoteId must be positive");
    assert!(logged[0].request.contains("note_id: -1"));
    assert_eq!(logged[0].handler_error, None);
    assert_eq!(logged[1].kind, ConditionKind::Post);
    assert_eq!(logged[1].violation, "no successful call to auth service");
    assert_eq!(logged[1].handler_error, Some(Code::NotFound));
}

#[tokio::test]
async fn at_e2e_02_failed_auth_is_recorded_and_violates_postcondition() {
    let (sink, logged) = capture_sink();
    let h = harness(sink);

    let status = get_note(
        &h,
        GetNoteRequest {
            note_id: 1,
            token: "wrong".to_string(),
        },
        true,
    )
    .await
    .expect_err("auth failure must reach the caller");
    assert_eq!(status.code(), Code::Unauthenticated);
    assert_eq!(status.message(), "authentication failed");

    let logged = logged.lock().unwrap();
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].kind, ConditionKind::Post);
    assert_eq!(logged[0].handler_error, Some(Code::Unauthenticated));
}

#[tokio::test]
async fn at_e2e_03_successful_auth_satisfies_contract() {
    let (sink, logged) = capture_sink();
    let h = harness(sink);

    let note = get_note(
        &h,
        GetNoteRequest {
            note_id: 1,
            token: "some-token-0".to_string(),
        },
        true,
    )
    .await
    .expect("note")
    .into_inner();
    assert_eq!(note.note_id, 1);
    assert!(logged.lock().unwrap().is_empty());
}

#[tokio::test]
async fn at_e2e_04_history_is_purged_after_success_and_failure() {
    let (sink, _) = capture_sink();
    let h = harness(sink);

    for (note_id, token) in [(1, "some-token-0"), (1, "wrong"), (7, "some-token-0")] {
        let _ = get_note(
            &h,
            GetNoteRequest {
                note_id,
                token: token.to_string(),
            },
            true,
        )
        .await;
        assert_eq!(h.contract.history().active_requests(), 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_e2e_05_concurrent_requests_do_not_share_history() {
    let (sink, logged) = capture_sink();
    let h = Arc::new(harness(sink));

    let mut tasks = Vec::new();
    for i in 0..16 {
        let h = Arc::clone(&h);
        tasks.push(tokio::spawn(async move {
            // odd requests authenticate successfully, even ones skip auth
            let call_auth = i % 2 == 1;
            get_note(
                &h,
                GetNoteRequest {
                    note_id: 1,
                    token: "some-token-0".to_string(),
                },
                call_auth,
            )
            .await
        }));
    }
    for task in tasks {
        task.await.unwrap().expect("note");
    }

    let logged = logged.lock().unwrap();
    assert_eq!(logged.len(), 8);
    assert!(logged
        .iter()
        .all(|l| l.kind == ConditionKind::Post && l.violation == "no successful call to auth service"));
    assert_eq!(h.contract.history().active_requests(), 0);
}

#[test]
fn at_e2e_06_duplicate_registration_is_rejected() {
    let (sink, _) = capture_sink();
    let contract = ServerContract::new(sink);
    contract
        .register_service_contract(get_note_contract())
        .unwrap();
    let err = contract
        .register_service_contract(
            ServiceContract::new(NOTE_STORE).rpc(UnaryContract::new("GetNote")),
        )
        .unwrap_err();
    assert_eq!(
        err,
        ContractError::DuplicateContract {
            full_method: "/noteservice.NoteStore/GetNote".to_string()
        }
    );

    let server = contract.server_interceptor();
    let kept = server
        .catalog()
        .resolve("/noteservice.NoteStore/GetNote")
        .unwrap();
    assert_eq!(kept.preconditions().len(), 1);
    assert_eq!(kept.postconditions().len(), 1);
}

#[test]
fn at_e2e_07_registration_after_serving_is_rejected() {
    let (sink, _) = capture_sink();
    let contract = ServerContract::new(sink);
    let _server = contract.server_interceptor();
    assert_eq!(
        contract.register_service_contract(get_note_contract()),
        Err(ContractError::AlreadyServing)
    );
}
