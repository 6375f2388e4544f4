//! Client for Brazil's PNCP public procurement API.
//!
//! [`PncpClient`] performs single-page fetches with error classification and
//! a bounded retry budget, and drives pagination. [`ContratacoesApi`] wraps
//! the procurement notice endpoints with typed filters and responses.

mod client;
mod contratacoes;

pub use client::{Filters, Page, PncpClient};
pub use contratacoes::{
    Contratacao, ContratacoesApi, DateWindow, OrgaoEntidade, UnidadeOrgao, parse_date,
};
