// Copyright 2026 BadCompany
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! querygate: a protective MCP proxy for database tool servers.
//!
//! This library provides the core logic for the querygate bridge, which sits
//! between an AI agent and a database MCP server, classifies SQL risk,
//! suspends high-risk calls for out-of-band human approval, and hard-caps
//! every response leaving the proxy.

pub mod config;
pub mod connectors;
pub mod engine;
pub mod engine_core;
pub mod mcp;
pub mod store;
