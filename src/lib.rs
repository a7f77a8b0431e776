pub mod xmpp_ws;
