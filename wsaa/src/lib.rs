// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

/*!
# WSAA

A client for AFIP's authentication and authorization service (WSAA, "Web Service de
Autenticación y Autorización"). Before calling one of AFIP's web services, such as electronic
invoicing (`wsfe`), a client must present a login ticket issued by WSAA for that service.

To obtain a ticket, the client builds a login ticket request naming the service, signs it with
a certificate registered with AFIP (producing a CMS SignedData structure), and submits it to
the `loginCms` operation. The response carries a `sign` and `token` pair which is valid for
about twelve hours.

The authority refuses to issue a new ticket for a service while a previously issued one is
still valid, so tickets must be reused. [`TicketIssuer`] caches every ticket it obtains and
returns the cached ticket until it expires.

```no_run
# async fn example() -> anyhow::Result<()> {
let config = wsaa::config::load_config(std::path::Path::new("/etc/wsaa/config.toml"))?;
let issuer = wsaa::TicketIssuer::from_config(config)?;
let ticket = issuer.ticket("wsfe").await?;
let authorization = ticket.authorization(20123456789);
# Ok(())
# }
```

## Components

* [`request`] builds the login ticket request document.
* [`signer`] loads the certificate and private key, and signs requests.
* [`gateway`] submits signed requests to the authority.
* [`ticket`] parses the authority's response.
* [`cache`] keeps issued tickets until they expire.
* [`issuer`] ties the above together.

Installing a `tracing` subscriber is left to the application.
*/

pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod issuer;
pub mod request;
pub mod signer;
pub mod ticket;
mod xml;

pub use error::Error;
pub use issuer::{Issuance, TicketIssuer, TicketSource};
pub use ticket::{Authorization, Ticket};
