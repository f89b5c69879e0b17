#![forbid(unsafe_code)]

use std::sync::Arc;

use rpc_contracts::{
    full_method_name, CallContext, CallHistory, ClientInterceptor, Condition, ContractResult,
    ServerContract, ServerInterceptor, ServiceContract, UnaryContract,
};
use tonic::{Request, Response, Status};

pub const NOTE_STORE_SERVICE: &str = "noteservice.NoteStore";
pub const AUTH_SERVICE: &str = "noteservice.AuthService";

pub mod pb {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Note {
        #[prost(int32, tag = "1")]
        pub note_id: i32,
        #[prost(string, tag = "2")]
        pub text: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct GetNoteRequest {
        #[prost(int32, tag = "1")]
        pub note_id: i32,
        #[prost(string, tag = "2")]
        pub token: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct AuthenticateRequest {
        #[prost(string, tag = "1")]
        pub token: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct AuthenticateResponse {
        #[prost(int32, tag = "1")]
        pub user_id: i32,
    }
}

#[derive(Debug, Clone)]
struct User {
    user_id: i32,
    token: String,
}

#[derive(Debug, Clone)]
pub struct AuthService {
    users: Vec<User>,
}

impl Default for AuthService {
    fn default() -> Self {
        Self {
            users: vec![
                User {
                    user_id: 0,
                    token: "some-token-0".to_string(),
                },
                User {
                    user_id: 1,
                    token: "some-token-1".to_string(),
                },
            ],
        }
    }
}

impl AuthService {
    pub async fn authenticate(
        &self,
        request: Request<pb::AuthenticateRequest>,
    ) -> Result<Response<pb::AuthenticateResponse>, Status> {
        let token = &request.get_ref().token;
        self.users
            .iter()
            .find(|user| &user.token == token)
            .map(|user| {
                Response::new(pb::AuthenticateResponse {
                    user_id: user.user_id,
                })
            })
            .ok_or_else(|| Status::unauthenticated("invalid token"))
    }
}

/// How the note store answers a lookup. `OffByOne` reproduces a buggy
/// implementation returning the wrong note id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteStoreMode {
    Correct,
    OffByOne,
}

pub struct NoteStore {
    notes: Vec<pb::Note>,
    auth: Arc<AuthService>,
    server: ServerInterceptor,
    client: ClientInterceptor,
    mode: NoteStoreMode,
}

impl NoteStore {
    pub fn new(
        contract: &ServerContract,
        auth: Arc<AuthService>,
        mode: NoteStoreMode,
    ) -> Self {
        Self {
            notes: vec![
                pb::Note {
                    note_id: 0,
                    text: "blah blah blah".to_string(),
                },
                pb::Note {
                    note_id: 1,
                    text: "very important note".to_string(),
                },
            ],
            auth,
            server: contract.server_interceptor(),
            client: contract.client_interceptor(),
            mode,
        }
    }

    pub async fn get_note(
        &self,
        request: Request<pb::GetNoteRequest>,
    ) -> Result<Response<pb::Note>, Status> {
        let method = full_method_name(NOTE_STORE_SERVICE, "GetNote");
        self.server
            .intercept(request, &method, |request| self.get_note_inner(request))
            .await
    }

    async fn get_note_inner(
        &self,
        request: Request<pb::GetNoteRequest>,
    ) -> Result<Response<pb::Note>, Status> {
        let ctx = CallContext::from_request(&request);
        let request = request.into_inner();
        self.authenticate(&ctx, &request.token)
            .await
            .map_err(|_| Status::unauthenticated("authentication failed"))?;

        let note = self
            .notes
            .iter()
            .find(|note| note.note_id == request.note_id)
            .ok_or_else(|| {
                Status::not_found(format!("no note with ID {}", request.note_id))
            })?;
        let note = match self.mode {
            NoteStoreMode::Correct => note.clone(),
            NoteStoreMode::OffByOne => pb::Note {
                note_id: note.note_id + 1,
                text: note.text.clone(),
            },
        };
        Ok(Response::new(note))
    }

    async fn authenticate(&self, ctx: &CallContext, token: &str) -> Result<i32, Status> {
        let method = full_method_name(AUTH_SERVICE, "Authenticate");
        let request = ctx.outbound(pb::AuthenticateRequest {
            token: token.to_string(),
        });
        let response = self
            .client
            .call(request, &method, |request| self.auth.authenticate(request))
            .await?;
        Ok(response.into_inner().user_id)
    }
}

pub fn note_store_contract() -> ServiceContract {
    ServiceContract::new(NOTE_STORE_SERVICE).rpc(
        UnaryContract::new("GetNote")
            .precondition(Condition::pre(|req: &pb::GetNoteRequest| {
                if req.note_id < 0 {
                    return Err("NoteId must be positive".into());
                }
                Ok(())
            }))
            .postcondition(Condition::post(
                |_resp: &pb::Note,
                 err: Option<&Status>,
                 _req: &pb::GetNoteRequest,
                 calls: &CallHistory| {
                    if err.is_some() {
                        return Ok(());
                    }
                    if calls
                        .filter(AUTH_SERVICE, "Authenticate")
                        .successful()
                        .is_empty()
                    {
                        return Err("no successful call to auth service".into());
                    }
                    Ok(())
                },
            ))
            .postcondition(Condition::post(
                |resp: &pb::Note,
                 err: Option<&Status>,
                 req: &pb::GetNoteRequest,
                 _calls: &CallHistory| {
                    if err.is_some() {
                        return Ok(());
                    }
                    if req.note_id != resp.note_id {
                        return Err("wrong note id in response".into());
                    }
                    Ok(())
                },
            )),
    )
}

/// Server contract with the note store contract registered, not yet serving.
pub fn build_server_contract(contract: ServerContract) -> ContractResult<ServerContract> {
    contract.register_service_contract(note_store_contract())?;
    Ok(contract)
}
