mod helpers;
mod transfers;
