//! `#[tokio_timeout_test]`: an async test that fails instead of hanging.
//!
//! The test body runs on its own thread with a fresh runtime. Both the
//! runtime (`tokio::time::timeout`) and the harness thread (`recv_timeout`)
//! enforce the limit, so a body that blocks the runtime still fails on time.
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test(30)]
//! async fn quick() {}
//!
//! #[test_timeout::tokio_timeout_test(secs = 30, flavor = "multi_thread", worker_threads = 4)]
//! async fn parallel() {}
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, Expr, ExprLit, ItemFn, Lit, LitInt, MetaNameValue, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    CurrentThread,
    MultiThread,
}

struct TestArgs {
    secs: u64,
    flavor: Flavor,
    worker_threads: Option<usize>,
}

impl Default for TestArgs {
    fn default() -> Self {
        Self {
            secs: DEFAULT_TIMEOUT_SECS,
            flavor: Flavor::CurrentThread,
            worker_threads: None,
        }
    }
}

impl Parse for TestArgs {
    fn parse(input: ParseStream<'_>) -> syn::Result<Self> {
        let mut args = TestArgs::default();
        if input.peek(LitInt) {
            let lit: LitInt = input.parse()?;
            args.secs = lit.base10_parse()?;
            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }

        let pairs = Punctuated::<MetaNameValue, Token![,]>::parse_terminated(input)?;
        for pair in pairs {
            let Some(name) = pair.path.get_ident().map(ToString::to_string) else {
                return Err(syn::Error::new_spanned(&pair.path, "expected an identifier"));
            };
            match (name.as_str(), literal(&pair.value)) {
                ("secs", Some(Lit::Int(lit))) => args.secs = lit.base10_parse()?,
                ("worker_threads", Some(Lit::Int(lit))) => {
                    args.worker_threads = Some(lit.base10_parse()?);
                }
                ("flavor", Some(Lit::Str(lit))) => {
                    args.flavor = match lit.value().as_str() {
                        "current_thread" => Flavor::CurrentThread,
                        "multi_thread" => Flavor::MultiThread,
                        _ => {
                            return Err(syn::Error::new_spanned(
                                lit,
                                "flavor must be \"current_thread\" or \"multi_thread\"",
                            ));
                        }
                    };
                }
                ("secs" | "worker_threads" | "flavor", _) => {
                    return Err(syn::Error::new_spanned(
                        &pair.value,
                        format!("unexpected value for `{name}`"),
                    ));
                }
                _ => {
                    return Err(syn::Error::new_spanned(
                        &pair.path,
                        format!("unknown argument `{name}`"),
                    ));
                }
            }
        }

        if args.secs == 0 {
            return Err(input.error("timeout must be greater than zero"));
        }
        if args.worker_threads.is_some() && args.flavor == Flavor::CurrentThread {
            return Err(input.error("worker_threads requires flavor = \"multi_thread\""));
        }
        Ok(args)
    }
}

fn literal(expr: &Expr) -> Option<&Lit> {
    match expr {
        Expr::Lit(ExprLit { lit, .. }) => Some(lit),
        _ => None,
    }
}

impl TestArgs {
    fn runtime_builder(&self) -> TokenStream2 {
        match (self.flavor, self.worker_threads) {
            (Flavor::CurrentThread, _) => quote! { tokio::runtime::Builder::new_current_thread() },
            (Flavor::MultiThread, None) => quote! { tokio::runtime::Builder::new_multi_thread() },
            (Flavor::MultiThread, Some(workers)) => quote! {
                {
                    let mut builder = tokio::runtime::Builder::new_multi_thread();
                    builder.worker_threads(#workers);
                    builder
                }
            },
        }
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TestArgs);

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let timeout = args.secs;
    let builder = args.runtime_builder();

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = #builder
                        .enable_all()
                        .build()
                        .expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        tokio::time::timeout(timeout_duration, async move #block)
                            .await
                            .expect("test timed out");
                    });
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
